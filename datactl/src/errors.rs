//! Error types for the sync service.
//!
//! The error hierarchy follows the propagation policy of the pipeline:
//!
//! - **Configuration errors** (unknown table, disabled table, missing
//!   incremental field) surface to the caller and are never retried.
//! - **Connectivity errors** (pool acquisition, query transport) are retried
//!   with bounded attempts before escalating to a sync-level failure.
//! - **Timeouts** fail the current batch only.
//! - **Validation errors** are per-row: rows are rejected and accounted,
//!   batches continue.
//! - **Invariant violations** in analytics refuse the write and escalate.
//! - **Database errors** wrap [`DbError`] which classifies constraint
//!   violations (unique conflicts become *skipped* rows in the writer).

use std::time::Duration;

use thiserror::Error as ThisError;

use crate::db::errors::DbError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid or incomplete sync configuration; surfaced to the caller, no retry
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Pool acquisition or query transport failure after retries were exhausted
    #[error("connectivity failure during {operation}: {cause}")]
    Connectivity { operation: String, cause: anyhow::Error },

    /// A query or job exceeded its time budget
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// A job observed shutdown and abandoned its current batch
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// Per-row validation failure (used when a caller needs a typed reject reason)
    #[error("validation failed for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// An analytics row violated its own invariants; the engine refuses to write
    #[error("analytics invariant violated: {message}")]
    Invariant { message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration { message: message.into() }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant { message: message.into() }
    }

    /// Whether the failure is worth retrying at a higher level.
    ///
    /// Configuration and invariant errors are deterministic; retrying them
    /// can only reproduce the same failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connectivity { .. } | Error::Timeout { .. })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DbError::from(err))
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            Error::Timeout {
                operation: "source read".into(),
                timeout: Duration::from_secs(60),
            }
            .is_retryable()
        );
        assert!(!Error::config("table not found").is_retryable());
        assert!(!Error::invariant("period_end <= period_start").is_retryable());
    }

    #[test]
    fn db_errors_wrap_transparently() {
        let err: Error = DbError::NotFound.into();
        assert!(matches!(err, Error::Database(DbError::NotFound)));
    }
}
