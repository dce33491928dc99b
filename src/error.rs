//! Error taxonomy for backend calls and queries.
//!
//! Backend-level errors ([`CallError`]) are absorbed by the dispatcher: they are
//! reported to the health tracker and excluded from the merge. Only [`QueryError`]
//! ever reaches a caller.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// Connection, transport or name resolution failure.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The per-call budget elapsed before the backend answered.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with a non-success status.
    #[error("backend returned status {0}")]
    Status(u16),

    /// The backend answered with a body we could not decode.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl CallError {
    /// Whether this failure is a timeout (as opposed to an error).
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }
}

/// Caller-visible query failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The query itself is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Every selected backend in every group failed or timed out.
    #[error("all backends failed ({attempted} attempted)")]
    AllBackendsFailed { attempted: usize },

    /// The query deadline elapsed before any backend responded.
    #[error("query deadline exceeded with {outstanding} call(s) outstanding")]
    DeadlineExceeded { outstanding: usize },

    /// The caller went away and the work was aborted.
    #[error("client canceled the query")]
    ClientCanceled,
}

impl QueryError {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            QueryError::InvalidQuery(_) => "invalid_query",
            QueryError::AllBackendsFailed { .. } => "all_backends_failed",
            QueryError::DeadlineExceeded { .. } => "deadline_exceeded",
            QueryError::ClientCanceled => "client_canceled",
        }
    }
}
