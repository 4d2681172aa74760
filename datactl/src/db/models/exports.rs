//! Export job lifecycle records.
//!
//! File generation itself happens outside the core; the core owns the row
//! lifecycle (PENDING through COMPLETED/FAILED) and the expiry sweep that
//! moves stale rows to EXPIRED before deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExportFormat {
    Csv,
    Json,
    Xlsx,
    Pdf,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DataExport {
    pub id: Uuid,
    pub export_type: String,
    pub format: ExportFormat,
    pub status: ExportStatus,
    pub progress_percentage: i32,
    pub file_path: Option<String>,
    pub error_message: Option<String>,
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
