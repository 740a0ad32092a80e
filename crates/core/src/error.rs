//! Queue-level error model.

use thiserror::Error;

/// Result type used by queue operations that are not storage-specific.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Deterministic failures caused by the caller (bad registration, bad payload,
/// unknown job). Storage and worker failures have their own types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A value failed validation (e.g. payload rejected by the job type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested job or job type does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state (duplicate name, wrong status).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
