//! Thin synchronous wrapper around external-binary execution.
//!
//! Two shapes: [`run`] combines stdout+stderr into one buffer and turns a
//! nonzero exit into a [`Error::ToolFailure`]; [`spawn_attached`] starts a
//! child and tees its stderr to a raw log file on disk and a line-oriented
//! structured stream, returning the live [`std::process::Child`] so the
//! caller owns the handle for the operation's lifetime.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Error, Result};

/// One line emitted by a child process's stderr, attributed back to the
/// invocation that produced it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogLine {
    pub command: String,
    pub line: String,
    pub correlation_id: String,
}

impl LogLine {
    /// Render as a single JSON line, for callers piping structured logs into
    /// a CI log aggregator rather than reading human-formatted tracing output.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.line.clone())
    }
}

/// Run `binary args...` to completion, capturing combined stdout+stderr.
///
/// On nonzero exit, returns [`Error::ToolFailure`] carrying the binary, the
/// argument vector, the exit status, and the full captured output.
pub fn run(binary: &Path, args: &[&str], correlation_id: &str) -> Result<String> {
    tracing::debug!(binary = %binary.display(), ?args, correlation_id, "invoking tool");

    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::io(binary, e))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        tracing::warn!(binary = %binary.display(), status = %output.status, "tool exited nonzero");
        return Err(Error::tool_failure(
            binary.display().to_string(),
            args,
            output.status,
            combined,
        ));
    }

    Ok(combined)
}

/// Run `binary args...`, writing `stdin_line` (plus a trailing newline) to
/// the child's stdin before reading its combined output. Used for the
/// interactive avd-manager custom-hardware-profile prompt.
pub fn run_with_stdin(binary: &Path, args: &[&str], stdin_line: &str, correlation_id: &str) -> Result<String> {
    tracing::debug!(binary = %binary.display(), ?args, correlation_id, "invoking tool with stdin");

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io(binary, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = writeln!(stdin, "{stdin_line}");
    }

    let output = child.wait_with_output().map_err(|e| Error::io(binary, e))?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(Error::tool_failure(
            binary.display().to_string(),
            args,
            output.status,
            combined,
        ));
    }

    Ok(combined)
}

/// A child process whose stdout and stderr are being teed to a log file (and,
/// for stderr, a structured log stream) on background threads for the
/// lifetime of the handle.
pub struct AttachedChild {
    pub child: Child,
    log_threads: Vec<thread::JoinHandle<()>>,
}

impl AttachedChild {
    /// Blocks until the tee threads observe EOF on the child's stdout and
    /// stderr pipes. Does NOT wait for the child itself to exit; callers
    /// that need the exit status should call `self.child.wait()`.
    pub fn join_log_thread(&mut self) {
        for h in self.log_threads.drain(..) {
            let _ = h.join();
        }
    }
}

/// Start `binary args...`, returning the child handle immediately. The
/// child's stdout is streamed to `log_path` on disk; its stderr is teed
/// line-by-line to `log_path` and to `on_line`, each stream drained on its
/// own background thread so neither can block the other.
pub fn spawn_attached<F>(
    binary: &Path,
    args: &[&str],
    extra_env: &[(&str, &str)],
    log_path: &Path,
    correlation_id: &str,
    mut on_line: F,
) -> Result<AttachedChild>
where
    F: FnMut(LogLine) + Send + 'static,
{
    tracing::info!(binary = %binary.display(), ?args, log = %log_path.display(), "starting child");

    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in extra_env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().map_err(|e| Error::io(binary, e))?;

    let log_file = File::create(log_path).map_err(|e| Error::io(log_path, e))?;
    let log_file = Arc::new(Mutex::new(log_file));

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let command_label = format!("{} {}", binary.display(), args.join(" "));
    let correlation_id = correlation_id.to_string();

    let mut log_threads = Vec::with_capacity(2);

    if let Some(mut out) = stdout {
        let log_file = Arc::clone(&log_file);
        log_threads.push(thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match out.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = log_file.lock().unwrap().write_all(&buf[..n]);
                    }
                }
            }
        }));
    }

    if let Some(err) = stderr {
        let log_file = Arc::clone(&log_file);
        log_threads.push(thread::spawn(move || {
            let reader = BufReader::new(err);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        let _ = writeln!(log_file.lock().unwrap(), "{line}");
                        tracing::debug!(command = %command_label, %line, correlation_id = %correlation_id, "child stderr");
                        on_line(LogLine {
                            command: command_label.clone(),
                            line,
                            correlation_id: correlation_id.clone(),
                        });
                    }
                    Err(_) => break,
                }
            }
        }));
    }

    Ok(AttachedChild { child, log_threads })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn run_captures_success_output() {
        let out = run(&PathBuf::from("echo"), &["hello"], "corr-1").unwrap();
        assert!(out.contains("hello"));
    }

    #[test]
    fn run_nonzero_exit_is_tool_failure() {
        let err = run(&PathBuf::from("false"), &[], "corr-1").unwrap_err();
        assert!(matches!(err, Error::ToolFailure { .. }));
    }
}
