//! Discovery & reconciliation: enumerate running emulators by taking the
//! union of the debug-bridge's device listing and a scan of the host
//! process table, since neither oracle is authoritative alone (see
//! "Dynamic oracle reconciliation" in the design notes).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::env::Environment;
use crate::error::Result;
use crate::port::{MAX_CONSOLE_PORT, MIN_CONSOLE_PORT};
use crate::tool;

/// One running emulator as reconciled from both oracles.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunningEmulator {
    pub name: String,
    pub serial: String,
    pub port: u16,
    pub pid: i32,
    pub booted: bool,
}

/// An enumeration of process ids with their launch argument vectors. The
/// reference implementation reads `/proc/<pid>/cmdline` on Linux; other
/// hosts provide an equivalent that returns the same shape.
pub trait ProcessEnumerator {
    fn enumerate(&self) -> Vec<(i32, Vec<String>)>;
}

/// Reads `/proc/<pid>/cmdline` for every numeric entry under `/proc`.
pub struct ProcfsEnumerator;

impl ProcessEnumerator for ProcfsEnumerator {
    fn enumerate(&self) -> Vec<(i32, Vec<String>)> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir("/proc") else {
            return out;
        };
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
                continue;
            };
            let cmdline_path = entry.path().join("cmdline");
            let Ok(raw) = fs::read(&cmdline_path) else {
                continue;
            };
            let argv: Vec<String> = raw
                .split(|b| *b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect();
            if !argv.is_empty() {
                out.push((pid, argv));
            }
        }
        out
    }
}

fn serial_for_port(port: u16) -> String {
    format!("emulator-{port}")
}

fn port_from_serial(serial: &str) -> Option<u16> {
    serial.strip_prefix("emulator-")?.parse().ok()
}

/// Parse `adb devices` tabular output into serials beginning with `emulator-`.
fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let first = line.split_whitespace().next()?;
            if first.starts_with("emulator-") {
                Some(first.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Resolve the AVD name bound to `serial` via the console `avd name` command.
fn resolve_name_via_console(env: &Environment, serial: &str) -> Option<String> {
    tool::run(
        &env.tools.adb,
        &["-s", serial, "emu", "avd", "name"],
        &env.correlation_id,
    )
    .ok()
    .and_then(|out| out.lines().next().map(|s| s.trim().to_string()))
    .filter(|s| !s.is_empty())
}

/// Extract the AVD name from an emulator process's argv (`-avd <name>`).
fn name_from_argv(argv: &[String]) -> Option<String> {
    let idx = argv.iter().position(|a| a == "-avd")?;
    argv.get(idx + 1).cloned()
}

/// Extract the console port from argv (`-port <N>`).
fn port_from_argv(argv: &[String]) -> Option<u16> {
    let idx = argv.iter().position(|a| a == "-port")?;
    argv.get(idx + 1)?.parse().ok()
}

fn looks_like_emulator_process(argv: &[String]) -> bool {
    argv.iter()
        .any(|a| a.contains("qemu-system") || a.contains("emulator"))
}

/// Probe the boot-completion property for `serial`; true iff it reads
/// exactly `"1"`.
fn probe_booted(env: &Environment, serial: &str) -> bool {
    tool::run(
        &env.tools.adb,
        &["-s", serial, "shell", "getprop", "sys.boot_completed"],
        &env.correlation_id,
    )
    .map(|out| out.trim() == "1")
    .unwrap_or(false)
}

/// Ensure the debug-bridge daemon is running (idempotent).
pub fn ensure_server_started(env: &Environment) -> Result<()> {
    tool::run(&env.tools.adb, &["start-server"], &env.correlation_id)?;
    Ok(())
}

/// Enumerate all running emulators as the union of the debug-bridge's
/// device listing and a scan of the process table.
pub fn list_running(env: &Environment, enumerator: &dyn ProcessEnumerator) -> Result<Vec<RunningEmulator>> {
    ensure_server_started(env)?;

    let mut by_port: BTreeMap<u16, RunningEmulator> = BTreeMap::new();

    let devices_output = tool::run(&env.tools.adb, &["devices"], &env.correlation_id)?;
    for serial in parse_adb_devices(&devices_output) {
        let Some(port) = port_from_serial(&serial) else {
            continue;
        };
        let name = resolve_name_via_console(env, &serial).unwrap_or_else(|| {
            enumerator
                .enumerate()
                .iter()
                .find(|(_, argv)| port_from_argv(argv) == Some(port))
                .and_then(|(_, argv)| name_from_argv(argv))
                .unwrap_or_default()
        });
        let pid = enumerator
            .enumerate()
            .iter()
            .find(|(_, argv)| port_from_argv(argv) == Some(port))
            .map(|(pid, _)| *pid)
            .unwrap_or(0);
        by_port.insert(
            port,
            RunningEmulator {
                name,
                serial,
                port,
                pid,
                booted: false,
            },
        );
    }

    for (pid, argv) in enumerator.enumerate() {
        if !looks_like_emulator_process(&argv) {
            continue;
        }
        let Some(port) = port_from_argv(&argv) else {
            continue;
        };
        if !(MIN_CONSOLE_PORT..=MAX_CONSOLE_PORT).contains(&port) {
            continue;
        }
        by_port.entry(port).or_insert_with(|| RunningEmulator {
            name: name_from_argv(&argv).unwrap_or_default(),
            serial: serial_for_port(port),
            port,
            pid,
            booted: false,
        });
    }

    let mut result: Vec<RunningEmulator> = by_port.into_values().collect();
    for emu in result.iter_mut() {
        emu.booted = probe_booted(env, &emu.serial);
    }
    Ok(result)
}

/// Look up a running emulator by AVD name.
pub fn find_by_name(env: &Environment, enumerator: &dyn ProcessEnumerator, name: &str) -> Result<Option<RunningEmulator>> {
    Ok(list_running(env, enumerator)?.into_iter().find(|e| e.name == name))
}

/// Validate that `serial` matches the `emulator-<port>` pattern, returning
/// the parsed port.
pub fn parse_serial(serial: &str) -> Result<u16> {
    let re = Regex::new(r"^emulator-(\d+)$").expect("static regex is valid");
    let caps = re
        .captures(serial)
        .ok_or_else(|| crate::error::Error::precondition(format!("serial '{serial}' does not match emulator-<port>")))?;
    caps[1]
        .parse()
        .map_err(|_| crate::error::Error::precondition(format!("serial '{serial}' has an unparseable port")))
}

/// True if `path` names an AVD directory carrying the clone-fingerprint
/// marker file written by the image store.
pub fn is_clone_fingerprinted(path: &Path) -> bool {
    path.join(".avdcore-clone").is_file()
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
    fn parses_adb_devices_table() {
        let out = "List of devices attached\nemulator-5554\tdevice\nsome-usb-device\tdevice\n";
        let serials = parse_adb_devices(out);
        assert_eq!(serials, vec!["emulator-5554"]);
    }

    #[test]
    fn parse_serial_rejects_bad_format() {
        assert!(parse_serial("emulator-abc").is_err());
        assert!(parse_serial("usb-0001").is_err());
        assert_eq!(parse_serial("emulator-5580").unwrap(), 5580);
    }

    #[test]
    fn name_and_port_extracted_from_argv() {
        let argv = vec![
            "/opt/android/emulator".to_string(),
            "-avd".to_string(),
            "w-acme".to_string(),
            "-port".to_string(),
            "5590".to_string(),
        ];
        assert_eq!(name_from_argv(&argv).as_deref(), Some("w-acme"));
        assert_eq!(port_from_argv(&argv), Some(5590));
        assert!(looks_like_emulator_process(&argv));
    }

    #[test]
    fn excludes_unrelated_port_forwarding_proxies() {
        let argv = vec!["/usr/bin/socat".to_string(), "-port".to_string(), "5590".to_string()];
        assert!(!looks_like_emulator_process(&argv));
    }

    #[test]
    fn empty_enumerator_has_no_process_hits() {
        let enumerator = FixedEnumerator(Vec::new());
        assert!(enumerator.enumerate().is_empty());
    }
}
