//! Per-table sync orchestration: extract, map, load, account, advance the
//! watermark.
//!
//! Every attempt writes a `data_sync_logs` row up front and finalizes it on
//! completion. Stage failures mark the log FAILED and come back as an
//! unsuccessful report (the scheduler then moves on to the next table);
//! configuration errors surface as `Err` before any log row exists.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::handlers::sync_configurations::SyncConfigurations;
use crate::db::handlers::sync_logs::SyncLogs;
use crate::db::models::sync_logs::{SyncLogOutcome, SyncOperation};
use crate::errors::{Error, Result};
use crate::etl::SyncMode;
use crate::etl::extract::{ReadOptions, SourceReader};
use crate::etl::load::{LoadStats, TargetWriter};
use crate::etl::tables::TableDescriptor;
use crate::etl::transform::{RejectedRecord, map_batch};
use crate::etl::value::Record;

/// Per-call knobs for one table sync.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Explicit watermark; overrides the persisted one.
    pub watermark: Option<DateTime<Utc>>,
    /// Batch size; overrides the descriptor and global defaults.
    pub batch_size: Option<usize>,
    /// Soft budget: exceeded means the run fails with a timeout at the next
    /// batch boundary.
    pub deadline: Option<Instant>,
    /// Shutdown signal; observed at batch boundaries.
    pub cancel: CancellationToken,
}

/// Outcome of one table sync attempt.
#[derive(Debug, Serialize)]
pub struct TableSyncReport {
    pub table: String,
    pub target_table: String,
    pub mode: SyncMode,
    pub success: bool,
    pub records_processed: u64,
    /// Rows that landed (inserted + updated) or were deliberately skipped.
    pub records_success: u64,
    /// Rows rejected by validation plus rows lost to rolled-back batches.
    pub records_failed: u64,
    pub load: LoadStats,
    pub rejected_records: Vec<RejectedRecord>,
    pub new_watermark: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log_id: Uuid,
    pub duration_ms: u64,
}

/// Orchestrates extract → transform → load for one table.
#[derive(Clone)]
pub struct TableSyncer {
    reader: SourceReader,
    writer: TargetWriter,
    logs: SyncLogs,
    configs: SyncConfigurations,
    default_batch_size: usize,
}

/// Running totals across the batches of one sync attempt.
#[derive(Default)]
struct SyncTotals {
    processed: u64,
    rejected: u64,
    batch_failed_rows: u64,
    load: LoadStats,
    rejected_records: Vec<RejectedRecord>,
    max_incremental: Option<DateTime<Utc>>,
}

impl SyncTotals {
    fn success_count(&self) -> u64 {
        (self.load.loaded + self.load.skipped) as u64
    }

    fn failed_count(&self) -> u64 {
        self.rejected + self.batch_failed_rows
    }
}

impl TableSyncer {
    pub fn new(
        reader: SourceReader,
        writer: TargetWriter,
        logs: SyncLogs,
        configs: SyncConfigurations,
        default_batch_size: usize,
    ) -> Self {
        Self {
            reader,
            writer,
            logs,
            configs,
            default_batch_size,
        }
    }

    /// Sync one table in the given mode.
    ///
    /// Returns `Err` only for configuration problems (disabled table,
    /// incremental sync without an incremental field) and for failures of the
    /// audit log itself. Pipeline failures finalize the log and come back as
    /// an unsuccessful report.
        pub async fn sync(&self, descriptor: &TableDescriptor, mode: SyncMode, opts: SyncOptions) -> Result<TableSyncReport> {
        if !descriptor.enabled {
            return Err(Error::config(format!("table '{}' is disabled", descriptor.source_table)));
        }
        if mode == SyncMode::Incremental && descriptor.incremental_field.is_none() {
            return Err(Error::config(format!(
                "table '{}' has no incremental field; only full sync is supported",
                descriptor.source_table
            )));
        }

        let started = Instant::now();
        let log_id = self
            .logs
            .start(SyncOperation::Sync, &mode.to_string(), Some(&descriptor.source_table))
            .await?;

        let batch_size = opts
            .batch_size
            .or(descriptor.batch_size)
            .unwrap_or(self.default_batch_size);

        let outcome = match mode {
            SyncMode::Incremental => self.run_incremental(descriptor, &opts, batch_size).await,
            SyncMode::Full => self.run_full(descriptor, &opts, batch_size).await,
        };

        match outcome {
            Ok(totals) => {
                let new_watermark = self.advance_watermark(descriptor, &totals).await;
                self.logs
                    .finalize(
                        log_id,
                        SyncLogOutcome::completed(
                            totals.processed as i64,
                            totals.success_count() as i64,
                            totals.failed_count() as i64,
                        )
                        .with_metadata(serde_json::json!({
                            "mode": mode,
                            "inserted": totals.load.inserted,
                            "updated": totals.load.updated,
                            "skipped": totals.load.skipped,
                            "rejected": totals.rejected,
                            "batch_errors": totals.load.errors,
                        })),
                    )
                    .await?;
                info!(
                    table = %descriptor.source_table,
                    processed = totals.processed,
                    loaded = totals.load.loaded,
                    rejected = totals.rejected,
                    "table sync completed"
                );
                Ok(self.report(descriptor, mode, totals, new_watermark, None, log_id, started))
            }
            Err(error) => {
                let message = error.to_string();
                let log_outcome = if matches!(error, Error::Cancelled { .. }) {
                    SyncLogOutcome::cancelled(message.clone())
                } else {
                    SyncLogOutcome::failed(message.clone())
                };
                self.logs.finalize(log_id, log_outcome).await?;
                warn!(table = %descriptor.source_table, "table sync failed: {message}");
                Ok(self.report(descriptor, mode, SyncTotals::default(), None, Some(message), log_id, started))
            }
        }
    }

    async fn run_incremental(
        &self,
        descriptor: &TableDescriptor,
        opts: &SyncOptions,
        batch_size: usize,
    ) -> std::result::Result<SyncTotals, Error> {
        let field = descriptor
            .incremental_field
            .as_deref()
            .expect("checked by sync()");

        // Watermark fallback chain: the persisted value survives restarts;
        // the last completed sync's start time covers rows migrated before
        // watermark tracking existed.
        let persisted = match self.configs.last_sync_at(&descriptor.source_table).await? {
            Some(watermark) => Some(watermark),
            None => self.logs.last_completed_sync(&descriptor.source_table).await?,
        };
        let watermark = resolve_watermark(opts.watermark, persisted, Utc::now());
        info!(table = %descriptor.source_table, %watermark, "incremental sync from watermark");

        check_interrupts(opts, "incremental sync")?;
        let batch = self
            .reader
            .read_batch(descriptor, &ReadOptions::incremental(batch_size, watermark))
            .await?;

        let mut totals = SyncTotals::default();
        if batch.rows.is_empty() {
            return Ok(totals);
        }

        totals.max_incremental = max_observed(&batch.rows, field);
        self.process_batch(descriptor, opts, batch.rows, &mut totals).await?;
        Ok(totals)
    }

    async fn run_full(
        &self,
        descriptor: &TableDescriptor,
        opts: &SyncOptions,
        batch_size: usize,
    ) -> std::result::Result<SyncTotals, Error> {
        let mut totals = SyncTotals::default();
        self.reader
            .read_all(descriptor, ReadOptions::full(batch_size), async |rows| {
                self.process_batch(descriptor, opts, rows, &mut totals).await
            })
            .await?;
        Ok(totals)
    }

    /// Map and load one batch, folding its accounting into the totals.
    ///
    /// A rolled-back batch is recorded (its rows count as failed) and the
    /// sync continues; transport failures propagate.
    async fn process_batch(
        &self,
        descriptor: &TableDescriptor,
        opts: &SyncOptions,
        rows: Vec<Record>,
        totals: &mut SyncTotals,
    ) -> std::result::Result<(), Error> {
        check_interrupts(opts, "table sync")?;

        totals.processed += rows.len() as u64;
        let mapped = map_batch(descriptor, rows, Utc::now());
        totals.rejected += mapped.stats.rejected as u64;
        totals.rejected_records.extend(mapped.rejected);
        info!(
            table = %descriptor.source_table,
            processed = mapped.stats.processed,
            transformed = mapped.stats.transformed,
            rejected = mapped.stats.rejected,
            success_rate = %format!("{:.2}%", mapped.stats.success_rate_pct()),
            "batch mapped"
        );

        let record_count = mapped.records.len() as u64;
        let stats = self.writer.load_batch(descriptor, mapped.records).await?;
        if !stats.errors.is_empty() {
            totals.batch_failed_rows += record_count;
        }
        totals.load.absorb(&stats);
        Ok(())
    }

    /// Persist the post-sync watermark: the highest incremental value
    /// observed, falling back to wall-clock now for runs (full syncs) that
    /// did not track one. Empty runs advance nothing.
    async fn advance_watermark(&self, descriptor: &TableDescriptor, totals: &SyncTotals) -> Option<DateTime<Utc>> {
        if descriptor.incremental_field.is_none() || totals.processed == 0 {
            return None;
        }
        let watermark = totals.max_incremental.unwrap_or_else(Utc::now);
        match self
            .configs
            .set_last_sync_at(&descriptor.source_table, watermark)
            .await
        {
            Ok(()) => Some(watermark),
            Err(e) => {
                // The sync itself succeeded; a stale watermark only means the
                // next incremental run re-reads some rows, which upserts absorb.
                warn!(table = %descriptor.source_table, "failed to persist watermark: {e}");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        descriptor: &TableDescriptor,
        mode: SyncMode,
        totals: SyncTotals,
        new_watermark: Option<DateTime<Utc>>,
        error: Option<String>,
        log_id: Uuid,
        started: Instant,
    ) -> TableSyncReport {
        TableSyncReport {
            table: descriptor.source_table.clone(),
            target_table: descriptor.target_table.clone(),
            mode,
            success: error.is_none(),
            records_processed: totals.processed,
            records_success: totals.success_count(),
            records_failed: totals.failed_count(),
            load: totals.load,
            rejected_records: totals.rejected_records,
            new_watermark,
            error,
            log_id,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Watermark resolution order: explicit option, persisted value, one hour
/// before now.
fn resolve_watermark(explicit: Option<DateTime<Utc>>, persisted: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    explicit.or(persisted).unwrap_or(now - ChronoDuration::hours(1))
}

/// Highest value of the incremental column across the extracted rows.
fn max_observed(rows: &[Record], field: &str) -> Option<DateTime<Utc>> {
    rows.iter().filter_map(|row| row.get(field)?.as_timestamp()).max()
}

fn check_interrupts(opts: &SyncOptions, operation: &str) -> std::result::Result<(), Error> {
    if opts.cancel.is_cancelled() {
        return Err(Error::Cancelled {
            operation: operation.to_string(),
        });
    }
    if let Some(deadline) = opts.deadline {
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                operation: format!("{operation} soft budget"),
                timeout: std::time::Duration::ZERO,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::value::SqlValue;
    use chrono::TimeZone;

    #[test]
    fn watermark_resolution_order() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let explicit = Utc.with_ymd_and_hms(2025, 3, 10, 10, 3, 0).unwrap();
        let persisted = Utc.with_ymd_and_hms(2025, 3, 9, 23, 0, 0).unwrap();

        assert_eq!(resolve_watermark(Some(explicit), Some(persisted), now), explicit);
        assert_eq!(resolve_watermark(None, Some(persisted), now), persisted);
        assert_eq!(resolve_watermark(None, None, now), now - ChronoDuration::hours(1));
    }

    #[test]
    fn max_observed_tracks_incremental_column() {
        let stamps = [
            Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 10, 10, 10, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 10, 10, 5, 0).unwrap(),
        ];
        let rows: Vec<Record> = stamps
            .iter()
            .map(|t| {
                let mut row = Record::new();
                row.insert("updated_at".into(), SqlValue::Timestamp(*t));
                row
            })
            .collect();
        assert_eq!(max_observed(&rows, "updated_at"), Some(stamps[1]));
        assert_eq!(max_observed(&rows, "missing"), None);
        assert_eq!(max_observed(&[], "updated_at"), None);
    }

    #[test]
    fn cancelled_token_interrupts_at_batch_boundary() {
        let opts = SyncOptions {
            cancel: CancellationToken::new(),
            ..SyncOptions::default()
        };
        assert!(check_interrupts(&opts, "sync").is_ok());

        opts.cancel.cancel();
        assert!(matches!(check_interrupts(&opts, "sync"), Err(Error::Cancelled { .. })));
    }

    #[test]
    fn expired_deadline_interrupts() {
        let opts = SyncOptions {
            deadline: Some(Instant::now() - std::time::Duration::from_secs(1)),
            ..SyncOptions::default()
        };
        assert!(matches!(check_interrupts(&opts, "sync"), Err(Error::Timeout { .. })));
    }
}
