//! Error types for brickd
//!
//! Provides the structured error taxonomy shared by the entity store, the
//! allocator, the pending-operation engine and the REST surface.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the daemon
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{kind} {id} is busy with pending operation {owner}")]
    Busy {
        kind: &'static str,
        id: String,
        owner: String,
    },

    // =========================================================================
    // Allocation Errors
    // =========================================================================
    #[error("No space: {0}")]
    NoSpace(String),

    #[error("Insufficient capacity: requested {requested} KiB, available {available} KiB")]
    InsufficientCapacity { requested: u64, available: u64 },

    // =========================================================================
    // Executor Errors
    // =========================================================================
    #[error("Executor failure on {host}: {reason}")]
    Executor { host: String, reason: String },

    #[error("Operation {operation} failed past the point of no return: {reason}")]
    Unrecoverable { operation: String, reason: String },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the caller of a failed operation may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, needs a changed request or operator action
    NoRetry,
}

impl Error {
    /// Shorthand for a missing entity
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for an executor failure
    pub fn executor(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Executor {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Remote command failures are often transient
            Error::Executor { .. } => ErrorAction::RetryWithBackoff,

            // Resource owned by someone else - wait for it to settle
            Error::Busy { .. } => ErrorAction::RetryAfter(Duration::from_secs(10)),

            // Capacity may be added by an operator
            Error::NoSpace(_) | Error::InsufficientCapacity { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(60))
            }

            // Needs a different request or manual reconciliation
            Error::NotFound { .. }
            | Error::Conflict(_)
            | Error::Validation(_)
            | Error::Configuration(_)
            | Error::Unrecoverable { .. } => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Whether Rollback may run after Exec returned this error
    ///
    /// Everything short of the point of no return can be compensated.
    pub fn is_rollback_safe(&self) -> bool {
        !matches!(self, Error::Unrecoverable { .. })
    }

    /// Stable machine-readable code used by the REST surface
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Busy { .. } => "busy",
            Error::NoSpace(_) | Error::InsufficientCapacity { .. } => "no_space",
            Error::Executor { .. } => "executor_failure",
            Error::Unrecoverable { .. } => "unrecoverable",
            Error::Validation(_) | Error::JsonParse(_) | Error::YamlParse(_) => "validation",
            Error::Configuration(_) => "configuration",
            Error::Internal(_) | Error::Io(_) => "internal",
        }
    }
}

/// Result type alias for the daemon
pub type Result<T> = std::result::Result<T, Error>;
