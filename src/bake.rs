//! Bake APKs: clone a fresh worker AVD from golden, boot it, install a list
//! of APKs, then kill it, leaving the installs baked into the clone's
//! userdata image.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::boot;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::storage;
use crate::supervisor;
use crate::tool;

/// Clone from `golden_dir`, boot it, install every path in `apks`, then kill
/// it. Returns the clone's userdata image path and size.
pub fn bake_apks(
    env: &Environment,
    base_name: &str,
    clone_name: &str,
    golden_dir: &Path,
    apks: &[PathBuf],
    boot_timeout: Duration,
) -> Result<(PathBuf, u64)> {
    if apks.is_empty() {
        return Err(Error::precondition("bake requires a non-empty APK list"));
    }

    storage::clone_from_golden(env, base_name, clone_name, golden_dir, None)?;

    let mut started = supervisor::start_without_port(env, clone_name, &[])?;
    let serial = started.serial.clone();

    let boot_outcome = boot::wait_for_boot(env, &serial, boot_timeout, |_, _| {});
    if let Err(e) = boot_outcome {
        let _ = started.child.child.kill();
        return Err(e);
    }

    for apk in apks {
        tool::run(
            &env.tools.adb,
            &["-s", &serial, "install", "-r", &apk.to_string_lossy()],
            &env.correlation_id,
        )?;
    }

    let _ = tool::run(&env.tools.adb, &["-s", &serial, "emu", "kill"], &env.correlation_id);
    let _ = started.child.child.kill();
    let _ = started.child.child.wait();

    let clone_dir = env.avd_dir(clone_name);
    for candidate in ["userdata-qemu.img", "userdata-qemu.img.qcow2"] {
        let path = clone_dir.join(candidate);
        if let Ok(meta) = std::fs::metadata(&path) {
            return Ok((path, meta.len()));
        }
    }
    Err(Error::not_found(format!("no userdata image found in {}", clone_dir.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bake_apks_rejects_empty_apk_list() {
        let env = crate::env::EnvironmentBuilder::new().build();
        let err = bake_apks(&env, "base", "clone", Path::new("/g/base"), &[], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
