//! Stop & cleanup: graceful kill via the debug-bridge console, escalating to
//! signals, plus sweeping orphaned processes and AVD directories.

use std::thread;
use std::time::Duration;

use crate::discovery::{self, ProcessEnumerator, RunningEmulator};
use crate::env::Environment;
use crate::error::Result;
use crate::process;
use crate::storage;
use crate::tool;

const POST_CONSOLE_KILL_WAIT: Duration = Duration::from_secs(1);
const POST_INTERRUPT_WAIT: Duration = Duration::from_secs(2);

fn find_pid_for_port(enumerator: &dyn ProcessEnumerator, port: u16) -> Option<i32> {
    enumerator
        .enumerate()
        .into_iter()
        .find(|(_, argv)| {
            let has_port = argv.windows(2).any(|w| w[0] == "-port" && w[1] == port.to_string());
            let looks_emulator = argv.iter().any(|a| a.contains("qemu-system") || a.contains("emulator"));
            has_port && looks_emulator
        })
        .map(|(pid, _)| pid)
}

/// Stop the emulator identified by `serial`. Idempotent: if nothing is
/// listening on the parsed port, returns success without error.
///
/// Escalation: console kill via the debug-bridge, wait 1s, re-check the
/// process table; if still alive, send an interrupt signal, wait 2s, then
/// SIGKILL if needed. Console-kill errors are only surfaced if the process
/// also could not be signalled.
pub fn stop_by_serial(env: &Environment, enumerator: &dyn ProcessEnumerator, serial: &str) -> Result<()> {
    let port = discovery::parse_serial(serial)?;

    let console_result = tool::run(&env.tools.adb, &["-s", serial, "emu", "kill"], &env.correlation_id);
    thread::sleep(POST_CONSOLE_KILL_WAIT);

    let Some(pid) = find_pid_for_port(enumerator, port) else {
        return Ok(());
    };

    if !process::is_alive(pid) {
        return Ok(());
    }

    let signalled = process::interrupt(pid);
    thread::sleep(POST_INTERRUPT_WAIT);

    if process::is_alive(pid) {
        process::kill(pid);
    }

    if !signalled {
        if let Err(e) = console_result {
            return Err(e);
        }
    }

    Ok(())
}

/// Stop the emulator running under `name`, if any. Idempotent: returns
/// success when no running emulator matches `name`.
pub fn stop_by_name(env: &Environment, enumerator: &dyn ProcessEnumerator, name: &str) -> Result<()> {
    match discovery::find_by_name(env, enumerator, name)? {
        Some(running) => stop_by_serial(env, enumerator, &running.serial),
        None => Ok(()),
    }
}

/// Orphans found by [`find_orphans`]: running emulator processes with no
/// discoverable AVD name match, and clone-fingerprinted AVD directories with
/// no corresponding running process.
pub struct Orphans {
    pub processes: Vec<RunningEmulator>,
    pub avd_dirs: Vec<std::path::PathBuf>,
}

/// Enumerate orphaned emulator processes (those discovery reports but that
/// no longer correspond to a live caller expectation is out of scope here;
/// "orphan" means simply unreferenced by any clone-fingerprinted AVD
/// directory) and orphaned AVD directories (clone-fingerprinted but with no
/// running process on their would-be port).
pub fn find_orphans(env: &Environment, enumerator: &dyn ProcessEnumerator) -> Result<Orphans> {
    let running = discovery::list_running(env, enumerator)?;
    let running_names: std::collections::HashSet<&str> = running.iter().map(|r| r.name.as_str()).collect();

    let mut avd_dirs = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&env.avd_home) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "avd").unwrap_or(false) && discovery::is_clone_fingerprinted(&path) {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !running_names.contains(name.as_str()) {
                    avd_dirs.push(path);
                }
            }
        }
    }

    Ok(Orphans {
        processes: running,
        avd_dirs,
    })
}

/// In force mode, stop each orphan process and remove each orphan AVD
/// directory. In dry-run mode (the default), callers should use
/// [`find_orphans`] directly and take no action.
pub fn cleanup_orphans(env: &Environment, enumerator: &dyn ProcessEnumerator, dry_run: bool) -> Result<Orphans> {
    let orphans = find_orphans(env, enumerator)?;
    if dry_run {
        return Ok(orphans);
    }

    for proc in &orphans.processes {
        stop_by_serial(env, enumerator, &proc.serial)?;
    }
    for dir in &orphans.avd_dirs {
        let name = dir.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        storage::delete_avd(env, &name)?;
    }

    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEnumerator(Vec<(i32, Vec<String>)>);
    impl ProcessEnumerator for FixedEnumerator {
        fn enumerate(&self) -> Vec<(i32, Vec<String>)> {
            self.0.clone()
        }
    }

    #[test]
    fn stop_by_serial_is_idempotent_when_nothing_listening() {
        let env = crate::env::EnvironmentBuilder::new().adb("true").build();
        let enumerator = FixedEnumerator(Vec::new());
        stop_by_serial(&env, &enumerator, "emulator-5580").unwrap();
        stop_by_serial(&env, &enumerator, "emulator-5580").unwrap();
    }

    #[test]
    fn stop_by_serial_rejects_malformed_serial() {
        let env = crate::env::EnvironmentBuilder::new().adb("true").build();
        let enumerator = FixedEnumerator(Vec::new());
        assert!(stop_by_serial(&env, &enumerator, "usb-0001").is_err());
    }

    #[test]
    fn stop_by_name_is_success_when_name_not_found() {
        let env = crate::env::EnvironmentBuilder::new().adb("true").build();
        let enumerator = FixedEnumerator(Vec::new());
        stop_by_name(&env, &enumerator, "nonexistent").unwrap();
    }
}
