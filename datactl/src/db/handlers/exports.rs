//! Repository for `data_exports` lifecycle rows.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::Result;
use crate::db::models::exports::{DataExport, ExportFormat, ExportStatus};

const EXPORT_COLUMNS: &str = "id, export_type, format, status, progress_percentage, file_path, error_message, \
     requested_by, created_at, expires_at";

pub struct DataExports {
    db: PgPool,
}

impl DataExports {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Register a new export request in PENDING state.
    #[instrument(skip(self), err)]
    pub async fn create(
        &self,
        export_type: &str,
        format: ExportFormat,
        requested_by: Option<&str>,
        retention: Duration,
    ) -> Result<DataExport> {
        let export = sqlx::query_as::<_, DataExport>(&format!(
            r#"
            INSERT INTO data_exports (export_type, format, requested_by, expires_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {EXPORT_COLUMNS}
            "#
        ))
        .bind(export_type)
        .bind(format)
        .bind(requested_by)
        .bind(Utc::now() + retention)
        .fetch_one(&self.db)
        .await?;
        Ok(export)
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, id: Uuid) -> Result<Option<DataExport>> {
        let export = sqlx::query_as::<_, DataExport>(&format!("SELECT {EXPORT_COLUMNS} FROM data_exports WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(export)
    }

    /// Move a PENDING/PROCESSING export forward. Progress is clamped to [0, 100].
    #[instrument(skip(self), err)]
    pub async fn set_progress(&self, id: Uuid, status: ExportStatus, progress_percentage: i32) -> Result<()> {
        sqlx::query("UPDATE data_exports SET status = $2, progress_percentage = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(progress_percentage.clamp(0, 100))
            .execute(&self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn mark_completed(&self, id: Uuid, file_path: &str) -> Result<()> {
        sqlx::query(
            "UPDATE data_exports SET status = 'COMPLETED', progress_percentage = 100, file_path = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(file_path)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query("UPDATE data_exports SET status = 'FAILED', error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Move past-expiry rows to EXPIRED. Idempotent; returns rows flipped.
    #[instrument(skip(self), err)]
    pub async fn expire_stale(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE data_exports SET status = 'EXPIRED' WHERE expires_at <= now() AND status <> 'EXPIRED'")
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop EXPIRED rows whose expiry is older than the grace window.
    #[instrument(skip(self), err)]
    pub async fn delete_expired_older_than(&self, days: i32) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM data_exports WHERE status = 'EXPIRED' AND expires_at < now() - make_interval(days => $1)")
                .bind(days)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected())
    }
}
