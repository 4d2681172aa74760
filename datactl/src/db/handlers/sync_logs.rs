//! Repository for the `data_sync_logs` audit table.
//!
//! Log rows use short-lived connections from the target pool, never the
//! batch transaction: a rolled-back batch must still leave its failure on
//! record.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::Result;
use crate::db::models::sync_logs::{SyncLog, SyncLogOutcome, SyncOperation};

const LOG_COLUMNS: &str = "id, sync_type, table_name, operation, records_processed, records_success, \
     records_failed, start_time, end_time, duration_ms, status, error_message, metadata";

#[derive(Clone)]
pub struct SyncLogs {
    db: PgPool,
}

impl SyncLogs {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Open a RUNNING log row for a new attempt and return its id.
    #[instrument(skip(self), err)]
    pub async fn start(&self, operation: SyncOperation, sync_type: &str, table_name: Option<&str>) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO data_sync_logs (sync_type, table_name, operation) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(sync_type)
        .bind(table_name)
        .bind(operation)
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    /// Finalize an attempt: set the terminal status, counters and timing.
    ///
    /// `duration_ms` is computed in SQL from the persisted `start_time` so it
    /// always equals `end_time - start_time` regardless of caller clocks.
    #[instrument(skip(self, outcome), fields(status = ?outcome.status), err)]
    pub async fn finalize(&self, id: Uuid, outcome: SyncLogOutcome) -> Result<()> {
        let outcome = outcome.normalized();
        sqlx::query(
            r#"
            UPDATE data_sync_logs
            SET end_time = now(),
                duration_ms = (EXTRACT(EPOCH FROM (now() - start_time)) * 1000)::bigint,
                status = $2,
                records_processed = $3,
                records_success = $4,
                records_failed = $5,
                error_message = $6,
                metadata = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.status)
        .bind(outcome.records_processed)
        .bind(outcome.records_success)
        .bind(outcome.records_failed)
        .bind(outcome.error_message)
        .bind(outcome.metadata)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, id: Uuid) -> Result<Option<SyncLog>> {
        let log = sqlx::query_as::<_, SyncLog>(&format!("SELECT {LOG_COLUMNS} FROM data_sync_logs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(log)
    }

    /// Most recent attempts, newest first.
    #[instrument(skip(self), err)]
    pub async fn recent(&self, limit: i64) -> Result<Vec<SyncLog>> {
        let logs = sqlx::query_as::<_, SyncLog>(&format!(
            "SELECT {LOG_COLUMNS} FROM data_sync_logs ORDER BY start_time DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(logs)
    }

    /// Start time of the last COMPLETED sync of the given table, if any.
    #[instrument(skip(self), err)]
    pub async fn last_completed_sync(&self, table_name: &str) -> Result<Option<DateTime<Utc>>> {
        let ts = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT start_time FROM data_sync_logs
            WHERE table_name = $1 AND operation = 'SYNC' AND status = 'COMPLETED'
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(table_name)
        .fetch_optional(&self.db)
        .await?;
        Ok(ts)
    }

    /// Delete log rows older than the retention window. Returns rows removed.
    #[instrument(skip(self), err)]
    pub async fn prune_older_than(&self, days: i32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM data_sync_logs WHERE start_time < now() - make_interval(days => $1)")
            .bind(days)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
