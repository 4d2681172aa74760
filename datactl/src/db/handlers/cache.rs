//! Repository for the `data_cache` table.
//!
//! Lookups never return expired entries even before the purge sweep has run;
//! expiry is enforced in the query, the sweep only reclaims space.

use sqlx::PgPool;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::cache::CacheEntry;

const CACHE_COLUMNS: &str = "id, cache_key, cache_data, ttl_seconds, created_at, expires_at";

pub struct DataCache {
    db: PgPool,
}

impl DataCache {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry = sqlx::query_as::<_, CacheEntry>(&format!(
            "SELECT {CACHE_COLUMNS} FROM data_cache WHERE cache_key = $1 AND expires_at > now()"
        ))
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(entry)
    }

    /// Store a value under `key`, replacing any previous entry and resetting
    /// the expiry from now.
    #[instrument(skip(self, data), err)]
    pub async fn put(&self, key: &str, data: &serde_json::Value, ttl_seconds: i32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO data_cache (cache_key, cache_data, ttl_seconds, expires_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $3::double precision))
            ON CONFLICT (cache_key)
            DO UPDATE SET cache_data = EXCLUDED.cache_data,
                          ttl_seconds = EXCLUDED.ttl_seconds,
                          created_at = now(),
                          expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(data)
        .bind(ttl_seconds)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM data_cache WHERE cache_key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete entries past their expiry. Idempotent; safe to call from both
    /// the cleanup job and ad-hoc maintenance paths.
    #[instrument(skip(self), err)]
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM data_cache WHERE expires_at <= now()")
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
