//! Emulator supervisor: launches the external `emulator` binary on a
//! specific port, tees its output to a log file and the structured log
//! stream, and returns its identity. Does not await child termination —
//! the child's lifetime is governed independently by stop & cleanup.

use std::path::PathBuf;

use crate::env::Environment;
use crate::error::Result;
use crate::port;
use crate::tool::{self, AttachedChild};

/// Canonical cold-boot, headless argument set. Order is not significant to
/// the emulator but kept stable for log readability.
fn canonical_args(name: &str, console_port: u16) -> Vec<String> {
    vec![
        "-avd".into(),
        name.into(),
        "-port".into(),
        console_port.to_string(),
        "-no-audio".into(),
        "-no-boot-anim".into(),
        "-no-window".into(),
        "-no-adb-auth".into(),
        "-no-snapshot-load".into(),
        "-no-snapshot-save".into(),
        "-no-metrics".into(),
        "-no-location-ui".into(),
        "-read-only".into(),
        "-gpu".into(),
        "swiftshader_indirect".into(),
        "-logcat-output".into(),
        "*:s".into(),
    ]
}

/// The identity of a just-started emulator: its serial, console/bridge
/// ports, child handle, and log file path.
pub struct StartedEmulator {
    pub name: String,
    pub serial: String,
    pub port: u16,
    pub log_path: PathBuf,
    pub child: AttachedChild,
}

/// Start `name` on `console_port`. Validates the port, opens the per-launch
/// log file, tees stdout+stderr to it and to the structured line stream.
pub fn start_on_port(env: &Environment, name: &str, console_port: u16, extra_args: &[String]) -> Result<StartedEmulator> {
    port::validate_console_port(console_port)?;
    port::probe_port_usable(console_port)?;

    let log_path = env.log_path(name, console_port);
    let mut args: Vec<String> = canonical_args(name, console_port);
    args.extend(extra_args.iter().cloned());
    let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

    let correlation_id = env.correlation_id.clone();
    let child = tool::spawn_attached(
        &env.tools.emulator,
        &args_ref,
        &[
            ("QEMU_DISABLE_FILE_LOCKING", "1"),
            ("ANDROID_ADB_SERVER_VENDOR_KEY_PATH", ""),
        ],
        &log_path,
        &correlation_id,
        move |line| {
            tracing::debug!(correlation_id = %line.correlation_id, command = %line.command, %line.line, "emulator stderr");
        },
    )?;

    Ok(StartedEmulator {
        name: name.to_string(),
        serial: format!("emulator-{console_port}"),
        port: console_port,
        log_path,
        child,
    })
}

/// Find a free port over `[5580, 5800)` and delegate to [`start_on_port`].
pub fn start_without_port(env: &Environment, name: &str, extra_args: &[String]) -> Result<StartedEmulator> {
    let console_port = port::find_free_even_port(5580, port::MAX_CONSOLE_PORT)?;
    start_on_port(env, name, console_port, extra_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_args_include_cold_boot_flags() {
        let args = canonical_args("w-acme", 5580);
        assert!(args.contains(&"-no-snapshot-load".to_string()));
        assert!(args.contains(&"-no-snapshot-save".to_string()));
        assert!(args.contains(&"-no-boot-anim".to_string()));
        assert!(args.contains(&"-no-window".to_string()));
        assert!(args.contains(&"-no-adb-auth".to_string()));
        assert!(args.windows(2).any(|w| w == ["-avd".to_string(), "w-acme".to_string()]));
        assert!(args.windows(2).any(|w| w == ["-port".to_string(), "5580".to_string()]));
    }

    #[test]
    fn start_on_port_rejects_invalid_port() {
        let env = crate::env::EnvironmentBuilder::new().build();
        let err = start_on_port(&env, "w-acme", 5581, &[]).unwrap_err();
        assert!(matches!(err, crate::error::Error::Precondition(_)));
    }
}
