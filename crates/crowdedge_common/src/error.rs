//! Error types for CrowdEdge device components.

use thiserror::Error;

/// Failure reasons for a radio configuration apply attempt.
///
/// Every variant except `FileNotFound` and `KeyLineNotFound` is raised
/// after the config file was already rewritten, so callers can assume a
/// rollback to the pre-attempt snapshot was attempted before they see it.
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("radio config not found at {path}")]
    FileNotFound { path: String },

    #[error("permission denied accessing {path}")]
    PermissionDenied { path: String },

    #[error("no ssid= line found in radio config")]
    KeyLineNotFound,

    #[error("service restart failed: {stderr}")]
    RestartFailed { stderr: String },

    #[error("service restart timed out after {seconds}s")]
    RestartTimeout { seconds: u64 },

    #[error("radio configuration error: {0}")]
    Unexpected(String),
}

#[derive(Error, Debug)]
pub enum EdgeError {
    /// Network-level failure. Retried on the next scheduled cycle,
    /// never within the same tick.
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend rejected the credential. Terminal until re-provisioned.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Submission queue is full. Surfaced to the caller so the portal
    /// can show a user-visible failure; submissions are never dropped.
    #[error("submission queue at capacity ({limit} items)")]
    Capacity { limit: usize },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("reconciliation failed: {0}")]
    Reconciliation(#[from] RadioError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EdgeResult<T> = Result<T, EdgeError>;
