//! Prewarm: an end-to-end "bring up a base AVD, let it finish booting, mark
//! it provisioned, then save it as a golden" workflow.

use std::thread;
use std::time::Duration;

use crate::boot;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::port;
use crate::storage;
use crate::supervisor;
use crate::tool;

const SERIAL_APPEARANCE_TIMEOUT: Duration = Duration::from_secs(60);
const SOFT_SUCCESS_USERDATA_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// Result of a successful prewarm: the golden directory and its total size.
pub struct PrewarmResult {
    pub golden_dir: std::path::PathBuf,
    pub size_bytes: u64,
}

fn userdata_image_size(env: &Environment, name: &str) -> u64 {
    let dir = env.avd_dir(name);
    for candidate in ["userdata-qemu.img", "userdata-qemu.img.qcow2"] {
        if let Ok(meta) = std::fs::metadata(dir.join(candidate)) {
            return meta.len();
        }
    }
    0
}

fn wait_for_serial(env: &Environment, serial: &str, timeout: Duration) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        if env.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("waiting for {serial} to appear cancelled")));
        }
        let devices = tool::run(&env.tools.adb, &["devices"], &env.correlation_id)?;
        if devices.lines().any(|l| l.split_whitespace().next() == Some(serial)) {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(start.elapsed(), format!("{serial} did not appear"), None));
        }
        thread::sleep(Duration::from_millis(500));
    }
}

fn mark_setup_complete(env: &Environment, serial: &str) -> Result<()> {
    let settle_commands: &[&[&str]] = &[
        &["shell", "settings", "put", "global", "device_provisioned", "1"],
        &["shell", "settings", "put", "secure", "user_setup_complete", "1"],
        &["shell", "locksettings", "set-disabled", "true"],
        &["shell", "wm", "dismiss-keyguard"],
    ];
    for args in settle_commands {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        // best-effort: a shell command failing here must not abort prewarm
        let _ = tool::run(&env.tools.adb, &full, &env.correlation_id);
    }
    Ok(())
}

/// Run prewarm for base AVD `name`: restart the debug-bridge daemon, start
/// the emulator on a fresh port, wait for its serial then for boot
/// completion, mark it provisioned, settle, kill it, and save golden.
///
/// Soft-success: if boot detection times out but the userdata image already
/// exceeds 1 MiB, proceeds to save-golden anyway rather than failing — the
/// debug bridge is known to lose devices at the moment Android finishes
/// booting.
pub fn prewarm(env: &Environment, name: &str, boot_timeout: Duration, extra_settle: Duration, golden_dest: &std::path::Path) -> Result<PrewarmResult> {
    tool::run(&env.tools.adb, &["kill-server"], &env.correlation_id)?;
    tool::run(&env.tools.adb, &["start-server"], &env.correlation_id)?;

    let console_port = port::find_free_even_port(5580, port::MAX_CONSOLE_PORT)?;
    let mut started = supervisor::start_on_port(env, name, console_port, &[])?;
    let serial = started.serial.clone();

    wait_for_serial(env, &serial, SERIAL_APPEARANCE_TIMEOUT)?;

    let boot_result = boot::wait_for_boot(env, &serial, boot_timeout, |_, _| {});

    if let Err(boot_err) = boot_result {
        let size = userdata_image_size(env, name);
        if size <= SOFT_SUCCESS_USERDATA_THRESHOLD_BYTES {
            let _ = started.child.child.kill();
            return Err(boot_err);
        }
        tracing::warn!(
            name,
            size,
            "boot wait timed out but userdata image looks populated; proceeding to save-golden"
        );
    } else {
        mark_setup_complete(env, &serial)?;
        thread::sleep(extra_settle);
    }

    let _ = tool::run(&env.tools.adb, &["-s", &serial, "emu", "kill"], &env.correlation_id);
    let _ = started.child.child.kill();
    let _ = started.child.child.wait();

    let avd_dir = env.avd_dir(name);
    let (golden_dir, size_bytes) = storage::save_golden(env, &avd_dir, golden_dest)?;

    Ok(PrewarmResult { golden_dir, size_bytes })
}
