//! Even console-port allocation and validation in the debug-bridge's
//! auto-discovery range.
//!
//! These bounds are compatibility-critical: they must match the debug-bridge
//! daemon's own port auto-discovery range, so they are not configurable.

use std::net::{TcpListener, SocketAddr};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

pub const MIN_CONSOLE_PORT: u16 = 5554;
pub const MAX_CONSOLE_PORT: u16 = 5800;

const PROBE_RETRIES: u32 = 3;
const PROBE_DELAY: Duration = Duration::from_secs(2);

/// Reject odd ports and ports outside `[5554, 5800]`.
pub fn validate_console_port(port: u16) -> Result<()> {
    if port % 2 != 0 {
        return Err(Error::precondition(format!(
            "port {port} is odd; the emulator console port must be even"
        )));
    }
    if !(MIN_CONSOLE_PORT..=MAX_CONSOLE_PORT).contains(&port) {
        return Err(Error::precondition(format!(
            "port {port} is outside the valid console range [{MIN_CONSOLE_PORT}, {MAX_CONSOLE_PORT}]"
        )));
    }
    Ok(())
}

fn can_bind_both(port: u16) -> bool {
    let bind_one = |p: u16| -> bool {
        let addr: SocketAddr = ([127, 0, 0, 1], p).into();
        TcpListener::bind(addr).is_ok()
    };
    bind_one(port) && bind_one(port + 1)
}

/// Find a free even port `p` in `[start, end)` such that both `p` and `p+1`
/// can be bound on loopback. `start` is rounded up to even if odd. Fails if
/// the range is exhausted with no socket allocations beyond the probes.
pub fn find_free_even_port(start: u16, end: u16) -> Result<u16> {
    let mut p = if start % 2 != 0 { start + 1 } else { start };
    while p < end {
        if can_bind_both(p) {
            return Ok(p);
        }
        p = p.saturating_add(2);
    }
    Err(Error::collision(format!(
        "no free even port in [{start}, {end})"
    )))
}

/// Re-probe both sockets of `port` up to three times with a fixed delay, to
/// tolerate sockets left in TIME_WAIT after a recent teardown. Returns an
/// error after exhausting the retry budget.
pub fn probe_port_usable(port: u16) -> Result<()> {
    for attempt in 1..=PROBE_RETRIES {
        if can_bind_both(port) {
            return Ok(());
        }
        if attempt < PROBE_RETRIES {
            thread::sleep(PROBE_DELAY);
        }
    }
    Err(Error::collision(format!(
        "port pair ({port}, {}) still in use after {PROBE_RETRIES} retries",
        port + 1
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_port() {
        assert!(validate_console_port(5581).is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(validate_console_port(5553).is_err());
        assert!(validate_console_port(5802).is_err());
    }

    #[test]
    fn accepts_in_range_even_port() {
        assert!(validate_console_port(5580).is_ok());
    }

    #[test]
    fn find_free_even_port_rounds_up_odd_start() {
        let p = find_free_even_port(5901, 5999).unwrap();
        assert_eq!(p % 2, 0);
        assert!(p >= 5902);
    }

    #[test]
    fn find_free_even_port_fails_on_empty_range() {
        assert!(find_free_even_port(6000, 6000).is_err());
    }
}
