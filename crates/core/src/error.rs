//! Error taxonomy for sync execution.
//!
//! Every failure that can surface from a handler is classified here so the
//! retry wrapper and the worker pool can decide what to do with it:
//! transient failures are retried with backoff, fatal failures abort the
//! attempt immediately. Lock contention is deliberately **not** an error;
//! it is the `Skipped` outcome, handled by the pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the sync core.
pub type SyncResult<T> = Result<T, SyncError>;

/// A failure raised while executing a sync job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network-level failure talking to an upstream platform (connect,
    /// reset, DNS). Retryable.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Upstream returned an HTTP-style status. 5xx is retryable, 4xx is
    /// fatal (the request itself is wrong and will not heal).
    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Input or payload failed validation. Fatal.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Required configuration is absent (e.g. missing API credentials).
    /// Fatal.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// The handler exceeded its wall-clock budget. Terminal for the
    /// attempt; the job is marked failed.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    /// The handler itself crashed (panicked). Fatal; the pool survives and
    /// records the failure.
    #[error("internal handler failure: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn missing_config(msg: impl Into<String>) -> Self {
        Self::MissingConfig(msg.into())
    }

    /// Whether the retry wrapper may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transient(_) => true,
            SyncError::Upstream { status, .. } => *status >= 500,
            SyncError::Validation(_)
            | SyncError::MissingConfig(_)
            | SyncError::Timeout(_)
            | SyncError::Internal(_) => false,
        }
    }

    /// Coarse classification recorded in outcome-log details.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::Upstream { .. } => ErrorKind::Upstream,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::MissingConfig(_) => ErrorKind::MissingConfig,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Discriminant of a [`SyncError`], kept in outcome-log details so the
/// audit trail stays queryable without parsing error strings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Upstream,
    Validation,
    MissingConfig,
    Timeout,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_retryable() {
        assert!(SyncError::transient("connection reset").is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(SyncError::upstream(503, "unavailable").is_retryable());
        assert!(SyncError::upstream(500, "boom").is_retryable());
        assert!(!SyncError::upstream(404, "not found").is_retryable());
        assert!(!SyncError::upstream(422, "unprocessable").is_retryable());
    }

    #[test]
    fn fatal_classes_are_not_retryable() {
        assert!(!SyncError::validation("bad sku").is_retryable());
        assert!(!SyncError::missing_config("api key").is_retryable());
        assert!(!SyncError::Timeout(Duration::from_secs(60)).is_retryable());
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(SyncError::transient("x").kind(), ErrorKind::Transient);
        assert_eq!(SyncError::upstream(500, "x").kind(), ErrorKind::Upstream);
        assert_eq!(SyncError::validation("x").kind(), ErrorKind::Validation);
    }
}
