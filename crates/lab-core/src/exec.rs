//! External command execution.
//!
//! The container engine CLI and the disk-image tools are driven as child
//! processes. [`CommandRunner`] is the injection seam: production uses
//! [`TokioCommandRunner`], tests substitute a scripted runner so no real
//! binaries are needed.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convenience constructor for a zero exit with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Convenience constructor for a non-zero exit with the given stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },
}

/// Boxed future returned by [`CommandRunner::run`].
pub type RunFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ExecError>> + Send + 'a>>;

/// Runs a program to completion under a deadline.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String], timeout: Duration)
    -> RunFuture<'a>;
}

/// Runs commands as real child processes via `tokio::process`.
///
/// The child is killed if the deadline passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        timeout: Duration,
    ) -> RunFuture<'a> {
        Box::pin(async move {
            debug!(%program, ?args, "running command");
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ExecError::Spawn {
                    program: program.to_string(),
                    source,
                })?;

            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }),
                Ok(Err(source)) => Err(ExecError::Spawn {
                    program: program.to_string(),
                    source,
                }),
                Err(_) => Err(ExecError::TimedOut {
                    program: program.to_string(),
                    after: timeout,
                }),
            }
        })
    }
}
