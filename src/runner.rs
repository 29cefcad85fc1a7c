//! External process execution.
//!
//! Everything hostkit does to the machine goes through a [`Runner`]: disk
//! tools, NetworkManager, systemd, the emulator itself. Commands are awaited
//! one at a time and a non-zero exit becomes [`HostkitError::ExternalCommand`].

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;

use crate::error::HostkitError;

/// A program plus its arguments, built up before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    stdin: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Feed `input` to the child's stdin. The input is never logged.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Runner {
    /// Run to completion, returning trimmed stdout. Non-zero exit is an error.
    async fn output(&self, cmd: &Cmd) -> Result<String, HostkitError>;

    /// Run to completion and report whether it succeeded. Never fails on exit status.
    async fn succeeds(&self, cmd: &Cmd) -> Result<bool, HostkitError>;

    /// Run with the terminal attached (stdin/stdout/stderr inherited) and
    /// block until the process exits. Non-zero exit is an error.
    async fn attached(&self, cmd: &Cmd) -> Result<(), HostkitError>;
}

/// Runs commands on the local host via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    async fn spawn_captured(&self, cmd: &Cmd) -> Result<std::process::Output, HostkitError> {
        let mut child = cmd
            .to_tokio()
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(cmd, e))?;

        if let (Some(input), Some(mut pipe)) = (cmd.stdin.as_deref(), child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| HostkitError::Io {
                    context: format!("writing stdin of {}", cmd.program),
                    source: e,
                })?;
            // dropping the pipe closes stdin
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| HostkitError::Io {
                context: format!("waiting for {}", cmd.program),
                source: e,
            })
    }
}

impl Runner for SystemRunner {
    async fn output(&self, cmd: &Cmd) -> Result<String, HostkitError> {
        tracing::info!(command = %cmd, "running");
        let output = self.spawn_captured(cmd).await?;
        if !output.status.success() {
            return Err(HostkitError::ExternalCommand {
                command: cmd.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn succeeds(&self, cmd: &Cmd) -> Result<bool, HostkitError> {
        tracing::debug!(command = %cmd, "probing");
        let output = self.spawn_captured(cmd).await?;
        Ok(output.status.success())
    }

    async fn attached(&self, cmd: &Cmd) -> Result<(), HostkitError> {
        tracing::info!(command = %cmd, "running attached");
        let status = cmd
            .to_tokio()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| spawn_error(cmd, e))?;

        if !status.success() {
            return Err(HostkitError::ExternalCommand {
                command: cmd.to_string(),
                code: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

fn spawn_error(cmd: &Cmd, e: std::io::Error) -> HostkitError {
    HostkitError::Io {
        context: format!("running {}", cmd.program),
        source: e,
    }
}

/// Whether `program` resolves on `PATH`.
pub fn on_path(program: &str) -> bool {
    which::which(program).is_ok()
}
