//! Command bridge to Android devices.
//!
//! Every device interaction in this crate (shell commands, file pushes,
//! port forwards, screenshots) goes through the [`DeviceBridge`] trait.  The
//! production implementation, [`AdbBridge`], spawns the `adb` executable with
//! a hard timeout; tests use [`mock::ScriptedBridge`].
//!
//! # Serial handling (for beginners)
//!
//! `adb -s <serial> <args…>` targets one device.  Commands that are not tied
//! to a device (`devices -l`, `connect host:port`) pass `serial = None`.

pub mod manager;
pub mod mock;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub use manager::DeviceManager;

/// Errors produced while running a bridge command.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The `adb` executable could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish within the configured timeout.
    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Reading the command's output failed.
    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Trimmed stdout.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn detail(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// Runs device commands.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Runs a command and captures its text output.
    async fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<CommandOutput, BridgeError>;

    /// Runs a command and returns its raw stdout bytes (used for screenshots).
    async fn run_raw(&self, serial: Option<&str>, args: &[&str]) -> Result<Vec<u8>, BridgeError>;

    /// Convenience wrapper for `shell <command>`.
    async fn shell(&self, serial: &str, command: &str) -> Result<CommandOutput, BridgeError> {
        self.run(Some(serial), &["shell", command]).await
    }
}

/// [`DeviceBridge`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
    timeout: Duration,
}

impl AdbBridge {
    pub fn new(adb_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            adb_path: adb_path.into(),
            timeout,
        }
    }

    fn command(&self, serial: Option<&str>, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn describe(serial: Option<&str>, args: &[&str]) -> String {
        match serial {
            Some(s) => format!("adb -s {s} {}", args.join(" ")),
            None => format!("adb {}", args.join(" ")),
        }
    }

    async fn output(
        &self,
        serial: Option<&str>,
        args: &[&str],
    ) -> Result<std::process::Output, BridgeError> {
        let description = Self::describe(serial, args);
        debug!(command = %description, "running bridge command");

        let child = self
            .command(serial, args)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: self.adb_path.display().to_string(),
                source,
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(BridgeError::Io {
                command: description,
                source,
            }),
            Err(_) => Err(BridgeError::Timeout {
                command: description,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn run(&self, serial: Option<&str>, args: &[&str]) -> Result<CommandOutput, BridgeError> {
        let output = self.output(serial, args).await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_raw(&self, serial: Option<&str>, args: &[&str]) -> Result<Vec<u8>, BridgeError> {
        let output = self.output(serial, args).await?;
        Ok(output.stdout)
    }
}
