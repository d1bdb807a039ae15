//! Error types for the A/B update torture tester.
//!
//! The taxonomy mirrors how failures are treated by the harness:
//!
//! - **Connection**: the management transport could not be established.
//!   Retried only by the reboot confirmation phase.
//! - **Timeout**: a bounded operation exceeded its budget. Retried for payload
//!   transfer, surfaced everywhere else.
//! - **CommandFailed**: a remote command exited non-zero and the caller did not
//!   ask for the failure to be suppressed.
//! - **Assertion**: an observed post-condition contradicts a slot invariant.
//!   Always fatal, never retried.
//! - **Protocol**: the device reported something outside its contract (for
//!   example a slot id other than 0 or 1).
//!
//! # Examples
//!
//! ```
//! use ab_torture::{Error, InvariantViolation, SlotId};
//!
//! let err = Error::Assertion(InvariantViolation::SlotUnchangedAfterUpdate {
//!     slot: SlotId::A,
//! });
//! assert!(err.is_fatal());
//! assert_eq!(err.code(), "E_ASSERT_SLOT_UNCHANGED");
//! ```

use crate::config::ConfigError;
use crate::slot::{Bootability, SlotId};
use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for torture-test operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the torture tester.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport to the device could not be established.
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// A bounded operation did not finish within its budget.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// A remote command exited with a non-zero status.
    #[error("Command `{command}` failed with exit status {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// An observed post-condition contradicts a slot invariant.
    #[error("Assertion failed: {0}")]
    Assertion(#[from] InvariantViolation),

    /// The device reported data outside of its documented contract.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The run configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A local I/O failure (spawning ssh, reading the payload, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The report could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A slot invariant that did not hold, together with the observed values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// An update completed and the device rebooted into the same slot.
    #[error("slot did not change after update, started and ended at {slot}")]
    SlotUnchangedAfterUpdate { slot: SlotId },

    /// A plain reboot moved the device to another slot.
    #[error("slot changed across a plain reboot: {before} -> {after}")]
    SlotChangedAfterReboot { before: SlotId, after: SlotId },

    /// A recovery step expected the slot to hold but it moved.
    #[error("slot changed during {context}: {before} -> {after}")]
    SlotChangedDuringRecovery {
        context: String,
        before: SlotId,
        after: SlotId,
    },

    /// The capsule update status did not report success.
    #[error("capsule update status is {observed:?}, expected {expected}")]
    CapsuleStatus { expected: i64, observed: Option<i64> },

    /// The capsule update is still forced after a verified capsule update.
    #[error("capsule update still forced after a successful capsule update")]
    CapsuleStillForced,

    /// The capsule update was expected to remain forced but is not.
    #[error("capsule update is no longer forced after an interrupted update")]
    CapsuleNotForced,

    /// A slot reported an unexpected bootability status.
    #[error("slot {slot} bootability is {observed}, expected {expected}")]
    Bootability {
        slot: SlotId,
        expected: Bootability,
        observed: Bootability,
    },

    /// The root filesystem device for the active slot is not mounted.
    #[error("device {device} for slot {slot} is not mounted")]
    NotMounted { slot: SlotId, device: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Convenience constructor for connection failures.
    pub fn connection(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Connection {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Returns `true` for connectivity failures that a retrying caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Timeout { .. })
    }

    /// Returns `true` if the error must abort the campaign or scenario.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Assertion(_) | Error::Protocol(_) | Error::Config(_)
        )
    }

    /// Returns `true` if this is an invariant assertion failure.
    pub fn is_assertion(&self) -> bool {
        matches!(self, Error::Assertion(_))
    }

    /// Returns an error code string for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connection { .. } => "E_CONNECTION",
            Error::Timeout { .. } => "E_TIMEOUT",
            Error::CommandFailed { .. } => "E_COMMAND",
            Error::Assertion(v) => match v {
                InvariantViolation::SlotUnchangedAfterUpdate { .. } => "E_ASSERT_SLOT_UNCHANGED",
                InvariantViolation::SlotChangedAfterReboot { .. } => "E_ASSERT_SLOT_CHANGED",
                InvariantViolation::SlotChangedDuringRecovery { .. } => {
                    "E_ASSERT_RECOVERY_SLOT_CHANGED"
                }
                InvariantViolation::CapsuleStatus { .. } => "E_ASSERT_CAPSULE_STATUS",
                InvariantViolation::CapsuleStillForced => "E_ASSERT_CAPSULE_FORCED",
                InvariantViolation::CapsuleNotForced => "E_ASSERT_CAPSULE_NOT_FORCED",
                InvariantViolation::Bootability { .. } => "E_ASSERT_BOOTABILITY",
                InvariantViolation::NotMounted { .. } => "E_ASSERT_NOT_MOUNTED",
            },
            Error::Protocol(_) => "E_PROTOCOL",
            Error::Config(_) => "E_CONFIG",
            Error::Io(_) => "E_IO",
            Error::Serialization(_) => "E_SERDE",
        }
    }
}
