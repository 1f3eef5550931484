//! Minimal smoke-test harness, not the CLI frontend.
//!
//! Exercises discovery and cleanup against whatever `adb`/`emulator` are
//! reachable on `PATH` (or overridden via `AVDCORE_*` env vars), so a
//! developer can sanity-check the core against a real or fake SDK without
//! a full command-line frontend.

use avdcore::{EnvironmentBuilder, Manager};

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("avdcore=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    init_logging();

    let env = EnvironmentBuilder::new().build();
    tracing::info!(version = avdcore::VERSION, avd_home = %env.avd_home.display(), "avdcore-debug starting");

    let manager = Manager::new(env);

    match manager.list_running() {
        Ok(running) => {
            for emu in running {
                println!("{}\t{}\tpid={}\tbooted={}", emu.name, emu.serial, emu.pid, emu.booted);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "list_running failed");
            std::process::exit(1);
        }
    }
}
