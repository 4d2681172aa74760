//! Sync audit log records.
//!
//! One `data_sync_logs` row is written per sync attempt and finalized when
//! the attempt completes. Rows are append-then-finalized: once a terminal
//! status is set they are never mutated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What kind of work a log row accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncOperation {
    Sync,
    Export,
    Import,
    Cleanup,
    Aggregate,
}

/// Lifecycle of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A persisted sync attempt.
///
/// Invariant (also enforced by a table CHECK): `records_success +
/// records_failed <= records_processed`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub sync_type: String,
    pub table_name: Option<String>,
    pub operation: SyncOperation,
    pub records_processed: i64,
    pub records_success: i64,
    pub records_failed: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Terminal accounting for a sync attempt, applied by
/// [`crate::db::handlers::sync_logs::SyncLogs::finalize`].
#[derive(Debug, Clone)]
pub struct SyncLogOutcome {
    pub status: SyncStatus,
    pub records_processed: i64,
    pub records_success: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl SyncLogOutcome {
    pub fn completed(processed: i64, success: i64, failed: i64) -> Self {
        Self {
            status: SyncStatus::Completed,
            records_processed: processed,
            records_success: success,
            records_failed: failed,
            error_message: None,
            metadata: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Failed,
            records_processed: 0,
            records_success: 0,
            records_failed: 0,
            error_message: Some(error.into()),
            metadata: None,
        }
    }

    pub fn cancelled(error: impl Into<String>) -> Self {
        Self {
            status: SyncStatus::Cancelled,
            ..Self::failed(error)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Clamp the counters so the accounting invariant holds even if a caller
    /// aggregated stats inconsistently.
    pub fn normalized(mut self) -> Self {
        let accounted = self.records_success + self.records_failed;
        if accounted > self.records_processed {
            self.records_processed = accounted;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_restores_accounting_invariant() {
        let outcome = SyncLogOutcome::completed(5, 4, 3).normalized();
        assert!(outcome.records_success + outcome.records_failed <= outcome.records_processed);
        assert_eq!(outcome.records_processed, 7);
    }

    #[test]
    fn completed_outcome_keeps_consistent_counts() {
        let outcome = SyncLogOutcome::completed(10, 8, 2).normalized();
        assert_eq!(outcome.records_processed, 10);
        assert_eq!(outcome.records_success + outcome.records_failed, 10);
    }
}
