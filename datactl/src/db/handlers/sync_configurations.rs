//! Repository for `sync_configurations`: per-table tuning plus the
//! incremental watermark.
//!
//! The watermark lives in `last_sync_at`. Persisting it here (rather than in
//! process memory) is what preserves incremental semantics across restarts:
//! a fresh process resumes from where the previous one finished instead of
//! falling back to the one-hour default window.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::sync_configurations::{ConfigStatus, SyncConfiguration};

const CONFIG_COLUMNS: &str = "id, table_name, sync_interval_minutes, batch_size, max_retries, \
     timeout_seconds, status, last_sync_at, created_at, updated_at";

/// Tuning defaults used when a table's row is first created.
#[derive(Debug, Clone, Copy)]
pub struct SyncTuning {
    pub sync_interval_minutes: i32,
    pub batch_size: i32,
    pub max_retries: i32,
    pub timeout_seconds: i32,
}

#[derive(Clone)]
pub struct SyncConfigurations {
    db: PgPool,
}

impl SyncConfigurations {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Create the table's row if it does not exist yet. Idempotent; existing
    /// tuning is left untouched.
    #[instrument(skip(self, tuning), err)]
    pub async fn ensure(&self, table_name: &str, tuning: SyncTuning) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_configurations (table_name, sync_interval_minutes, batch_size, max_retries, timeout_seconds)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (table_name) DO NOTHING
            "#,
        )
        .bind(table_name)
        .bind(tuning.sync_interval_minutes)
        .bind(tuning.batch_size)
        .bind(tuning.max_retries)
        .bind(tuning.timeout_seconds)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, table_name: &str) -> Result<Option<SyncConfiguration>> {
        let config = sqlx::query_as::<_, SyncConfiguration>(&format!(
            "SELECT {CONFIG_COLUMNS} FROM sync_configurations WHERE table_name = $1"
        ))
        .bind(table_name)
        .fetch_optional(&self.db)
        .await?;
        Ok(config)
    }

    #[instrument(skip(self), err)]
    pub async fn list(&self) -> Result<Vec<SyncConfiguration>> {
        let configs =
            sqlx::query_as::<_, SyncConfiguration>(&format!("SELECT {CONFIG_COLUMNS} FROM sync_configurations ORDER BY table_name"))
                .fetch_all(&self.db)
                .await?;
        Ok(configs)
    }

    /// Current incremental watermark for a table.
    #[instrument(skip(self), err)]
    pub async fn last_sync_at(&self, table_name: &str) -> Result<Option<DateTime<Utc>>> {
        let watermark = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT last_sync_at FROM sync_configurations WHERE table_name = $1",
        )
        .bind(table_name)
        .fetch_optional(&self.db)
        .await?;
        Ok(watermark.flatten())
    }

    /// Advance the watermark after a successful sync.
    #[instrument(skip(self), err)]
    pub async fn set_last_sync_at(&self, table_name: &str, watermark: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_configurations (table_name, last_sync_at)
            VALUES ($1, $2)
            ON CONFLICT (table_name)
            DO UPDATE SET last_sync_at = EXCLUDED.last_sync_at, updated_at = now()
            "#,
        )
        .bind(table_name)
        .bind(watermark)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn set_status(&self, table_name: &str, status: ConfigStatus) -> Result<()> {
        sqlx::query("UPDATE sync_configurations SET status = $2, updated_at = now() WHERE table_name = $1")
            .bind(table_name)
            .bind(status)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
