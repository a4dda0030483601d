//! Error types for ZShare
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for ZShare operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ZShare
#[derive(Debug, Error)]
pub enum Error {
    // Setup errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Caller contract violations
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no helper registered for share protocol: {0}")]
    UnknownProtocol(String),

    // Resource lookup
    #[error("share resource not found: {0}")]
    NotFound(String),

    // Command execution
    #[error("command `{cmd}` failed: {stderr}")]
    ProcessExecution { cmd: String, stderr: String },

    #[error("malformed command output: {0}")]
    Parse(String),

    // Teardown
    #[error("resource {name} still busy after deadline, could not destroy it")]
    StillBusy { name: String },

    // Replication
    #[error("replication error: {0}")]
    Replication(String),

    // Data-loss guard
    #[error(
        "shrinking {name} to {requested_gb}G would lose data: {used_gb}G already consumed"
    )]
    ShrinkPossibleDataLoss {
        name: String,
        requested_gb: u64,
        used_gb: u64,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a process execution error from a command and its stderr
    pub fn process(cmd: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ProcessExecution {
            cmd: cmd.into(),
            stderr: stderr.into(),
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The raw stderr carried by a process execution failure, if any
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ProcessExecution { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Check whether command stderr carries the transient "dataset is busy"
/// signature emitted by `zfs destroy`.
///
/// String matching against the tool's message format is brittle but
/// intentional; keeping every matched substring here makes the coupling
/// swappable in one place.
#[must_use]
pub fn is_busy_signature(stderr: &str) -> bool {
    stderr.contains("dataset is busy")
}
