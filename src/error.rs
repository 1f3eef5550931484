//! Error taxonomy for the core.
//!
//! Every operation returns [`Result<T>`], an alias over this crate's [`Error`].
//! Each variant carries the context a caller needs for a post-mortem without
//! re-running the failed operation: the binary and argv for tool failures,
//! the elapsed timeout and last subordinate error for timeouts, and so on.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller-supplied argument violates a precondition (empty name, bad port, ...).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The requested resource already exists, or a slot is already taken.
    #[error("collision: {0}")]
    Collision(String),

    /// An external binary exited with a nonzero status.
    #[error("`{binary}` {args:?} exited with {status}: {output}")]
    ToolFailure {
        binary: String,
        args: Vec<String>,
        status: String,
        output: String,
    },

    /// A bounded wait expired before the awaited condition held.
    #[error("timed out after {elapsed:?}: {message}")]
    Timeout {
        elapsed: Duration,
        message: String,
        #[source]
        last: Option<Box<Error>>,
    },

    /// Filesystem error during image copy, directory creation, symlink creation, log open, etc.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The caller's cancellation handle fired at a poll boundary.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Discovery by name/serial yielded no match where one was required.
    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn collision(msg: impl Into<String>) -> Self {
        Error::Collision(msg.into())
    }

    pub fn tool_failure(binary: impl Into<String>, args: &[impl AsRef<str>], status: ExitStatus, output: impl Into<String>) -> Self {
        Error::ToolFailure {
            binary: binary.into(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            status: format!("{status}"),
            output: output.into(),
        }
    }

    pub fn timeout(elapsed: Duration, msg: impl Into<String>, last: Option<Error>) -> Self {
        Error::Timeout {
            elapsed,
            message: msg.into(),
            last: last.map(Box::new),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// True for the kinds a caller may reasonably want to treat as "try again".
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Collision(_))
    }
}
