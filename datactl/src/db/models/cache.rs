//! Response cache entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CacheEntry {
    pub id: Uuid,
    pub cache_key: String,
    pub cache_data: serde_json::Value,
    pub ttl_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
