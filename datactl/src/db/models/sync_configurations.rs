//! Per-table sync tuning and watermark persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfigStatus {
    Active,
    Inactive,
    Error,
}

/// One row per syncable table.
///
/// `last_sync_at` doubles as the incremental watermark: it survives process
/// restarts so incremental runs never re-read rows the previous process
/// already loaded.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SyncConfiguration {
    pub id: Uuid,
    pub table_name: String,
    pub sync_interval_minutes: i32,
    pub batch_size: i32,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub status: ConfigStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
