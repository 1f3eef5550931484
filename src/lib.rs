//! Core lifecycle manager for disposable Android Virtual Devices.
//!
//! Four tightly coupled subsystems: the image lifecycle engine
//! ([`storage`]), the emulator supervisor ([`supervisor`]), the
//! boot-readiness detector ([`boot`]), and the process & port discovery
//! layer ([`discovery`]). [`facade::Manager`] is the entry point most
//! callers want; the rest of this crate's modules are usable standalone for
//! callers that need finer control.
//!
//! Nothing in this crate reads ambient process state once an [`env::Environment`]
//! has been resolved, and no operation retains global state across calls.

pub mod bake;
pub mod boot;
pub mod discovery;
pub mod env;
pub mod error;
pub mod facade;
pub mod port;
pub mod prewarm;
pub mod process;
pub mod sanitize;
pub mod stop;
pub mod storage;
pub mod supervisor;
pub mod tool;

pub use env::{CancellationHandle, Environment, EnvironmentBuilder};
pub use error::{Error, Result};
pub use facade::Manager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
