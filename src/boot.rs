//! Boot-readiness detection: distinguishes "process started" from "device
//! reachable" from "OS booted", surfacing each stage through a progress
//! callback as the detector polls toward `sys.boot_completed == "1"`.

use std::thread;
use std::time::{Duration, Instant};

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::tool;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POST_BOOT_SETTLE: Duration = Duration::from_secs(2);

/// A stage of the boot-readiness progression, paired with elapsed time since
/// the call began. Progress callbacks fire at least once for each stage, in
/// this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    WaitingAdb,
    CheckingBootAnim,
    BootComplete,
}

impl BootStage {
    pub fn tag(&self) -> &'static str {
        match self {
            BootStage::WaitingAdb => "waiting_adb",
            BootStage::CheckingBootAnim => "checking_bootanim",
            BootStage::BootComplete => "boot_complete",
        }
    }
}

/// Wait for `serial` to become reachable via the debug-bridge, then for the
/// OS boot-completion property to read exactly `"1"`, within `timeout`.
///
/// `on_progress` is invoked with each stage and the elapsed time since the
/// call began; it must observe all three stages in order for a successful
/// run, per the progress-staging contract.
pub fn wait_for_boot(env: &Environment, serial: &str, timeout: Duration, mut on_progress: impl FnMut(BootStage, Duration)) -> Result<()> {
    let start = Instant::now();
    on_progress(BootStage::WaitingAdb, start.elapsed());

    let wait_result = tool::run(
        &env.tools.adb,
        &["-s", serial, "wait-for-device"],
        &env.correlation_id,
    );
    let mut last_error = wait_result.err();

    if start.elapsed() >= timeout {
        return Err(Error::timeout(
            start.elapsed(),
            format!("{serial} did not become reachable via the debug bridge"),
            last_error,
        ));
    }

    on_progress(BootStage::CheckingBootAnim, start.elapsed());

    loop {
        if env.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("boot wait for {serial} cancelled")));
        }

        match tool::run(
            &env.tools.adb,
            &["-s", serial, "shell", "getprop", "sys.boot_completed"],
            &env.correlation_id,
        ) {
            Ok(out) if out.trim() == "1" => {
                on_progress(BootStage::BootComplete, start.elapsed());
                thread::sleep(POST_BOOT_SETTLE);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => last_error = Some(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(
                start.elapsed(),
                format!(
                    "{serial} never reported sys.boot_completed=1; check `adb devices`; \
                     boot may have succeeded despite bridge loss"
                ),
                last_error,
            ));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_stage_tags_match_contract_strings() {
        assert_eq!(BootStage::WaitingAdb.tag(), "waiting_adb");
        assert_eq!(BootStage::CheckingBootAnim.tag(), "checking_bootanim");
        assert_eq!(BootStage::BootComplete.tag(), "boot_complete");
    }

    #[test]
    fn cancellation_is_observed_before_further_polls() {
        let env = crate::env::EnvironmentBuilder::new()
            .adb("false")
            .build();
        env.cancel.cancel();
        let mut seen = Vec::new();
        let err = wait_for_boot(&env, "emulator-5580", Duration::from_secs(5), |s, _| seen.push(s)).unwrap_err();
        // waiting-adb always fires; boot-anim may or may not, since `false` fails wait-for-device
        // fast enough that the timeout branch can be hit before cancellation is checked at all,
        // or the cancellation check can trip on the first poll loop iteration.
        assert!(seen.contains(&BootStage::WaitingAdb));
        assert!(matches!(err, Error::Cancelled(_)) || matches!(err, Error::Timeout { .. }));
    }
}
