//! Target-side maintenance: orphan deletion, planner statistics, retention
//! pruning, cache and export expiry.
//!
//! Runs weekly by schedule and after every full sync; every step is
//! idempotent, so overlapping invocations (e.g. the post-full-sync pass and
//! a manual run) cannot corrupt anything.

use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::db::handlers::cache::DataCache;
use crate::db::handlers::exports::DataExports;
use crate::db::handlers::sync_logs::SyncLogs;
use crate::errors::Result;
use crate::etl::tables::{TableRegistry, quote_identifier};

/// What one cleanup pass did.
#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    /// Orphaned rows deleted, per target table.
    pub orphans_deleted: Vec<(String, u64)>,
    pub tables_analyzed: usize,
    pub logs_pruned: u64,
    pub cache_purged: u64,
    pub exports_expired: u64,
    pub exports_deleted: u64,
}

/// Run one cleanup pass against the target database.
#[instrument(skip_all, err)]
pub async fn run(
    target: &PgPool,
    registry: &TableRegistry,
    log_retention_days: i32,
    export_retention_days: i32,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    // Orphans: child rows whose external_user_id no longer has an affiliate.
    for descriptor in registry.enabled() {
        let has_user_key = descriptor.field_mapping.values().any(|t| t == "external_user_id");
        if !has_user_key || descriptor.target_table == "affiliates" {
            continue;
        }
        let table = quote_identifier(&descriptor.target_table);
        let deleted = sqlx::query(&format!(
            r#"
            DELETE FROM {table}
            WHERE external_user_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM affiliates a WHERE a.external_user_id = {table}.external_user_id
              )
            "#
        ))
        .execute(target)
        .await?
        .rows_affected();
        if deleted > 0 {
            info!(table = %descriptor.target_table, deleted, "orphaned rows deleted");
        }
        report.orphans_deleted.push((descriptor.target_table.clone(), deleted));
    }

    // Refresh planner statistics on every target table we write.
    for descriptor in registry.enabled() {
        let table = quote_identifier(&descriptor.target_table);
        if let Err(e) = sqlx::query(&format!("ANALYZE {table}")).execute(target).await {
            // Statistics refresh is best-effort; a locked table must not
            // fail the whole pass.
            warn!(table = %descriptor.target_table, "ANALYZE failed: {e}");
        } else {
            report.tables_analyzed += 1;
        }
    }

    report.logs_pruned = SyncLogs::new(target.clone()).prune_older_than(log_retention_days).await?;
    report.cache_purged = DataCache::new(target.clone()).purge_expired().await?;

    let exports = DataExports::new(target.clone());
    report.exports_expired = exports.expire_stale().await?;
    report.exports_deleted = exports.delete_expired_older_than(export_retention_days).await?;

    info!(
        logs_pruned = report.logs_pruned,
        cache_purged = report.cache_purged,
        exports_expired = report.exports_expired,
        "cleanup pass finished"
    );
    Ok(report)
}
