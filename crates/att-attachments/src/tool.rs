//! Subprocess boundary for external tools
//!
//! Commands are always built as argument vectors; file paths are never
//! interpolated into a shell string.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failure of an external command
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} produced no output file")]
    NoOutput { program: String },
}

/// A single invocation of an external command
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
    capture_stderr: bool,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            capture_stderr: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.as_os_str().to_os_string())
    }

    /// Keep stderr for the error message instead of discarding it
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run to completion and return stdout
    pub async fn run(self) -> Result<String, ProcessError> {
        let program = self.program_name();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if self.capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        debug!(program = %program, args = ?self.args, "Running external tool");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ProcessError::Timeout {
                program: program.clone(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Failed {
                program,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
