//! Process execution behind a narrow trait
//!
//! The driver core only ever hands over ordered argument vectors and
//! reads back `(stdout, stderr)`. Keeping the process plumbing behind
//! `Executor` keeps the core testable with scripted fakes.

use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use zshare_common::{Error, Result};

/// Captured output of a finished command
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Synchronous command execution contract consumed by the driver core.
///
/// A non-zero exit surfaces as `Error::ProcessExecution` carrying the
/// raw stderr text so callers can classify tool-specific failure
/// signatures.
pub trait Executor: Send + Sync {
    /// Run a command to completion.
    fn execute(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Run a command, retrying transient failures a fixed number of
    /// times before giving up.
    fn execute_with_retry(&self, argv: &[&str]) -> Result<CommandOutput>;
}

/// Executor backed by local child processes.
///
/// A literal `"|"` token splits the vector into two children connected
/// stdout to stdin; replication transfers are issued this way as
/// `ssh <src> zfs send ... | ssh <dst> zfs receive ...`.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    retry_attempts: u32,
    retry_interval: Duration,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl LocalExecutor {
    #[must_use]
    pub fn new(retry_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            retry_attempts,
            retry_interval,
        }
    }

    fn run_single(argv: &[&str]) -> Result<CommandOutput> {
        let cmd = argv.join(" ");
        let output = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::process(&cmd, e.to_string()))?;
        finish(&cmd, output)
    }

    fn run_pipeline(left: &[&str], right: &[&str]) -> Result<CommandOutput> {
        let cmd = format!("{} | {}", left.join(" "), right.join(" "));
        let mut sender = Command::new(left[0])
            .args(&left[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(&cmd, e.to_string()))?;
        let sender_stdout = sender
            .stdout
            .take()
            .ok_or_else(|| Error::process(&cmd, "sender stdout pipe missing"))?;

        let receiver = Command::new(right[0])
            .args(&right[1..])
            .stdin(Stdio::from(sender_stdout))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::process(&cmd, e.to_string()))?;

        let received = receiver
            .wait_with_output()
            .map_err(|e| Error::process(&cmd, e.to_string()))?;
        let sent = sender
            .wait_with_output()
            .map_err(|e| Error::process(&cmd, e.to_string()))?;

        if !sent.status.success() {
            return Err(Error::process(
                &cmd,
                String::from_utf8_lossy(&sent.stderr).into_owned(),
            ));
        }
        finish(&cmd, received)
    }
}

fn finish(cmd: &str, output: std::process::Output) -> Result<CommandOutput> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(Error::process(cmd, stderr))
    }
}

impl Executor for LocalExecutor {
    fn execute(&self, argv: &[&str]) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Err(Error::invalid_request("empty command"));
        }
        debug!(cmd = %argv.join(" "), "executing command");
        match argv.iter().position(|a| *a == "|") {
            Some(pipe) if pipe > 0 && pipe + 1 < argv.len() => {
                Self::run_pipeline(&argv[..pipe], &argv[pipe + 1..])
            }
            Some(_) => Err(Error::invalid_request("pipeline missing a side")),
            None => Self::run_single(argv),
        }
    }

    fn execute_with_retry(&self, argv: &[&str]) -> Result<CommandOutput> {
        let mut last_err = None;
        for attempt in 1..=self.retry_attempts {
            match self.execute(argv) {
                Ok(out) => return Ok(out),
                Err(err) => {
                    warn!(
                        cmd = %argv.join(" "),
                        attempt,
                        %err,
                        "command failed, will retry"
                    );
                    last_err = Some(err);
                    if attempt < self.retry_attempts {
                        thread::sleep(self.retry_interval);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::invalid_request("empty command")))
    }
}
