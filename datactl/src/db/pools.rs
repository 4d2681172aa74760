//! The source/target database pool pair.
//!
//! The pipeline reads from one PostgreSQL database and writes to another.
//! [`DbPools`] wraps the two SQLx pools and makes the routing explicit:
//! `.source()` for extraction queries (read-only by contract), `.target()`
//! for upserts, bookkeeping and analytics rollups.
//!
//! Both pools are process-wide. A write batch holds exactly one target
//! connection inside a transaction for its whole duration; sync-log writes
//! use separate short-lived acquisitions from the same pool.

use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::PoolSettings;
use crate::errors::{Error, Result};

/// Source and target connection pools.
#[derive(Clone, Debug)]
pub struct DbPools {
    source: PgPool,
    target: PgPool,
}

/// Point-in-time pool statistics for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

impl DbPools {
    pub fn new(source: PgPool, target: PgPool) -> Self {
        Self { source, target }
    }

    /// Connect both pools from configuration.
    ///
    /// Failure here is fatal to initialization: the process cannot do useful
    /// work with only one side of the pipeline reachable.
    pub async fn connect(
        source_url: &str,
        source_settings: &PoolSettings,
        target_url: &str,
        target_settings: &PoolSettings,
    ) -> Result<Self> {
        let source = pool_options(source_settings)
            .connect(source_url)
            .await
            .map_err(|e| Error::Connectivity {
                operation: "source pool connect".into(),
                cause: anyhow::Error::from(e),
            })?;
        let target = pool_options(target_settings)
            .connect(target_url)
            .await
            .map_err(|e| Error::Connectivity {
                operation: "target pool connect".into(),
                cause: anyhow::Error::from(e),
            })?;
        Ok(Self { source, target })
    }

    /// Pool for extraction queries against the operational database.
    pub fn source(&self) -> &PgPool {
        &self.source
    }

    /// Pool for all writes: target tables, rollups, sync logs.
    pub fn target(&self) -> &PgPool {
        &self.target
    }

    /// Round-trip both databases. Used by initialization (fatal on failure)
    /// and by the status endpoint (reported as unhealthy).
    pub async fn ping_both(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.source)
            .await
            .map_err(|e| Error::Connectivity {
                operation: "source ping".into(),
                cause: anyhow::Error::from(e),
            })?;
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.target)
            .await
            .map_err(|e| Error::Connectivity {
                operation: "target ping".into(),
                cause: anyhow::Error::from(e),
            })?;
        Ok(())
    }

    pub fn source_stats(&self) -> PoolStats {
        PoolStats {
            size: self.source.size(),
            idle: self.source.num_idle(),
        }
    }

    pub fn target_stats(&self) -> PoolStats {
        PoolStats {
            size: self.target.size(),
            idle: self.target.num_idle(),
        }
    }

    /// Close both pools. Called after the scheduler has drained.
    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}

fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(if settings.idle_timeout_secs > 0 {
            Some(Duration::from_secs(settings.idle_timeout_secs))
        } else {
            None
        })
        .max_lifetime(if settings.max_lifetime_secs > 0 {
            Some(Duration::from_secs(settings.max_lifetime_secs))
        } else {
            None
        })
}
