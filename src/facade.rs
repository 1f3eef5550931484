//! Public manager facade: binds an [`Environment`] to a fluent set of typed
//! operations, enforces the not-already-running invariant before any Run
//! variant, and wraps every operation in a tracing span carrying the
//! correlation id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bake;
use crate::boot::{self, BootStage};
use crate::discovery::{self, ProcessEnumerator, ProcfsEnumerator, RunningEmulator};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::prewarm::{self, PrewarmResult};
use crate::stop::{self, Orphans};
use crate::storage::{self, AvdDescriptor};
use crate::supervisor::{self, StartedEmulator};

const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(180);

/// The facade: the single entry point most callers use. Internally it is a
/// thin binder around the free functions in the sibling modules, adding the
/// "not already running" check and tracing spans.
pub struct Manager {
    env: Environment,
    enumerator: Box<dyn ProcessEnumerator + Send + Sync>,
}

impl Manager {
    /// Build a facade bound to `env`, using the host's default process
    /// enumerator (`/proc` on Linux).
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            enumerator: Box::new(ProcfsEnumerator),
        }
    }

    /// Build a facade with a caller-supplied process enumerator, for tests
    /// or non-Linux hosts implementing the `ProcessEnumerator` abstraction.
    pub fn with_enumerator(env: Environment, enumerator: Box<dyn ProcessEnumerator + Send + Sync>) -> Self {
        Self { env, enumerator }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    fn not_already_running(&self, name: &str) -> Result<()> {
        if discovery::find_by_name(&self.env, self.enumerator.as_ref(), name)?.is_some() {
            return Err(Error::collision(format!("AVD '{name}' is already running")));
        }
        Ok(())
    }

    pub fn init_base(&self, name: &str, image_id: &str, device: &str) -> Result<AvdDescriptor> {
        let _span = tracing::info_span!("init_base", correlation_id = %self.env.correlation_id, name).entered();
        storage::init_base(&self.env, name, image_id, device).inspect_err(|e| tracing::error!(error = %e, "init_base failed"))
    }

    pub fn save_golden(&self, source_dir: &Path, dest: &Path) -> Result<(PathBuf, u64)> {
        let _span = tracing::info_span!("save_golden", correlation_id = %self.env.correlation_id).entered();
        storage::save_golden(&self.env, source_dir, dest).inspect_err(|e| tracing::error!(error = %e, "save_golden failed"))
    }

    pub fn clone_from_golden(&self, base_name: &str, clone_name: &str, golden_dir: &Path) -> Result<(PathBuf, u64)> {
        let _span = tracing::info_span!("clone", correlation_id = %self.env.correlation_id, base_name, clone_name).entered();
        self.not_already_running(clone_name)?;
        storage::clone_from_golden(&self.env, base_name, clone_name, golden_dir, self.env.config_template.as_deref())
            .inspect_err(|e| tracing::error!(error = %e, "clone failed"))
    }

    /// Start `name` on a specific console port. Rejects a collision if `name`
    /// is already running.
    pub fn run_on_port(&self, name: &str, port: u16, extra_args: &[String]) -> Result<StartedEmulator> {
        let _span = tracing::info_span!("run_on_port", correlation_id = %self.env.correlation_id, name, port).entered();
        self.not_already_running(name)?;
        supervisor::start_on_port(&self.env, name, port, extra_args).inspect_err(|e| tracing::error!(error = %e, "run_on_port failed"))
    }

    /// Start `name` on the first free port in the supervisor's default
    /// range. Rejects a collision if `name` is already running.
    pub fn run(&self, name: &str, extra_args: &[String]) -> Result<StartedEmulator> {
        let _span = tracing::info_span!("run", correlation_id = %self.env.correlation_id, name).entered();
        self.not_already_running(name)?;
        supervisor::start_without_port(&self.env, name, extra_args).inspect_err(|e| tracing::error!(error = %e, "run failed"))
    }

    pub fn wait_for_boot(&self, serial: &str, timeout: Duration, on_progress: impl FnMut(BootStage, Duration)) -> Result<()> {
        let _span = tracing::info_span!("wait_for_boot", correlation_id = %self.env.correlation_id, serial).entered();
        boot::wait_for_boot(&self.env, serial, timeout, on_progress).inspect_err(|e| tracing::error!(error = %e, "wait_for_boot failed"))
    }

    pub fn list_running(&self) -> Result<Vec<RunningEmulator>> {
        let _span = tracing::info_span!("list_running", correlation_id = %self.env.correlation_id).entered();
        discovery::list_running(&self.env, self.enumerator.as_ref()).inspect_err(|e| tracing::error!(error = %e, "list_running failed"))
    }

    pub fn stop_by_serial(&self, serial: &str) -> Result<()> {
        let _span = tracing::info_span!("stop_by_serial", correlation_id = %self.env.correlation_id, serial).entered();
        stop::stop_by_serial(&self.env, self.enumerator.as_ref(), serial).inspect_err(|e| tracing::error!(error = %e, "stop_by_serial failed"))
    }

    pub fn stop_by_name(&self, name: &str) -> Result<()> {
        let _span = tracing::info_span!("stop_by_name", correlation_id = %self.env.correlation_id, name).entered();
        stop::stop_by_name(&self.env, self.enumerator.as_ref(), name).inspect_err(|e| tracing::error!(error = %e, "stop_by_name failed"))
    }

    pub fn cleanup_orphans(&self, dry_run: bool) -> Result<Orphans> {
        let _span = tracing::info_span!("cleanup_orphans", correlation_id = %self.env.correlation_id, dry_run).entered();
        stop::cleanup_orphans(&self.env, self.enumerator.as_ref(), dry_run).inspect_err(|e| tracing::error!(error = %e, "cleanup_orphans failed"))
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let _span = tracing::info_span!("delete", correlation_id = %self.env.correlation_id, name).entered();
        storage::delete_avd(&self.env, name).inspect_err(|e| tracing::error!(error = %e, "delete failed"))
    }

    pub fn prewarm(&self, name: &str, boot_timeout: Duration, extra_settle: Duration, golden_dest: &Path) -> Result<PrewarmResult> {
        let _span = tracing::info_span!("prewarm", correlation_id = %self.env.correlation_id, name).entered();
        prewarm::prewarm(&self.env, name, boot_timeout, extra_settle, golden_dest).inspect_err(|e| tracing::error!(error = %e, "prewarm failed"))
    }

    pub fn bake_apks(&self, base_name: &str, clone_name: &str, golden_dir: &Path, apks: &[PathBuf]) -> Result<(PathBuf, u64)> {
        let _span = tracing::info_span!("bake_apks", correlation_id = %self.env.correlation_id, base_name, clone_name).entered();
        self.not_already_running(clone_name)?;
        bake::bake_apks(&self.env, base_name, clone_name, golden_dir, apks, DEFAULT_BOOT_TIMEOUT)
            .inspect_err(|e| tracing::error!(error = %e, "bake_apks failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyEnumerator;
    impl ProcessEnumerator for EmptyEnumerator {
        fn enumerate(&self) -> Vec<(i32, Vec<String>)> {
            Vec::new()
        }
    }

    #[test]
    fn run_checks_not_already_running_before_delegating() {
        let env = crate::env::EnvironmentBuilder::new()
            .adb("true")
            .emulator("/nonexistent/avdcore-test-emulator-binary")
            .build();
        let manager = Manager::with_enumerator(env, Box::new(EmptyEnumerator));
        // With no running emulators, the collision check passes and the
        // failure surfaces from the actual launch attempt instead.
        let result = manager.run("w-acme", &[]);
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
