//! The remote command transport contract.
//!
//! A [`CommandChannel`] executes a command string on the device and captures its
//! output, or uploads a local file. A [`Connector`] opens new channels. The
//! concrete OpenSSH implementation lives in [`crate::ssh`]; tests use
//! [`crate::mock`].

use crate::config::DeviceTarget;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The elevated execution wrapper applied when [`RunOptions::elevated`] is set.
pub const ELEVATE_PREFIX: &str = "sudo -n";

/// Options for a single remote command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Run through the elevated execution wrapper.
    pub elevated: bool,
    /// Return the output instead of an error when the exit status is non-zero.
    pub allow_failure: bool,
    /// Kill the command and fail with a timeout after this long.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    /// Default options: unprivileged, failures are errors, no timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the elevated execution wrapper when `elevated` is true.
    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    /// Do not turn a non-zero exit status into an error.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    /// Bound the command by `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit status; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A failed result with the given exit status and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Returns `true` when the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit status into [`Error::CommandFailed`] unless
    /// `allow_failure` is set.
    pub fn check(self, command: &str, opts: &RunOptions) -> Result<Self> {
        if self.success() || opts.allow_failure {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Wraps `command` with the elevated execution wrapper when requested.
pub fn effective_command(command: &str, opts: &RunOptions) -> String {
    if opts.elevated {
        format!("{} {}", ELEVATE_PREFIX, command)
    } else {
        command.to_string()
    }
}

/// An open transport to one device.
pub trait CommandChannel {
    /// Executes `command` on the device.
    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput>;

    /// Copies `local` to `remote` on the device.
    fn upload(&mut self, local: &Path, remote: &str, timeout: Option<Duration>) -> Result<()>;

    /// Tears the transport down. Must be idempotent.
    fn close(&mut self) {}
}

/// Opens channels to a device.
pub trait Connector {
    /// Establishes a new transport, failing with [`Error::Connection`] or
    /// [`Error::Timeout`].
    fn connect(
        &self,
        target: &DeviceTarget,
        timeout: Duration,
    ) -> Result<Box<dyn CommandChannel>>;
}
