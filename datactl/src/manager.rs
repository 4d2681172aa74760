//! The process-wide facade over the pipeline.
//!
//! [`CoreManager`] owns the pools, the table registry, the syncer, the
//! analytics engine and the scheduler. It is constructed once, initialized
//! once (re-entry after success is a no-op), handed to callers as an
//! explicit `Arc` rather than ambient global state, and stopped gracefully:
//! stop the scheduler, wait for in-flight jobs, then close the pools.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::analytics::AnalyticsEngine;
use crate::analytics::period::PeriodType;
use crate::cleanup::{self, CleanupReport};
use crate::config::Config;
use crate::db::handlers::analytics::{AffiliateAnalyticsRepo, UserAnalyticsRepo};
use crate::db::handlers::sync_configurations::{SyncConfigurations, SyncTuning};
use crate::db::handlers::sync_logs::SyncLogs;
use crate::db::models::analytics::{AffiliateAnalytics, UserAnalytics};
use crate::db::models::sync_logs::{SyncLogOutcome, SyncOperation};
use crate::db::pools::{DbPools, PoolStats};
use crate::errors::{Error, Result};
use crate::etl::SyncMode;
use crate::etl::extract::{ReadOptions, SourceReader};
use crate::etl::load::TargetWriter;
use crate::etl::syncer::{SyncOptions, TableSyncReport, TableSyncer};
use crate::etl::tables::{TableDescriptor, TableRegistry};
use crate::provider::{ConfigProvider, StaticConfigProvider};
use crate::scheduler::{JobRunner, Scheduler, SchedulerStatus};

/// Cumulative process counters.
#[derive(Debug, Default)]
struct CoreCounters {
    tables_synced: AtomicU64,
    records_processed: AtomicU64,
    records_loaded: AtomicU64,
    sync_failures: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CounterSnapshot {
    pub tables_synced: u64,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub sync_failures: u64,
}

/// Aggregated result of one multi-table sync pass.
#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub mode: SyncMode,
    pub reports: Vec<TableSyncReport>,
    pub tables_succeeded: usize,
    pub tables_failed: usize,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Health and progress snapshot for operators.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub healthy: bool,
    pub initialized: bool,
    pub source_pool: PoolStats,
    pub target_pool: PoolStats,
    pub scheduler: SchedulerStatus,
    pub counters: CounterSnapshot,
}

pub struct CoreManager {
    config: Config,
    pools: DbPools,
    registry: TableRegistry,
    reader: SourceReader,
    syncer: TableSyncer,
    analytics: AnalyticsEngine,
    provider: Arc<StaticConfigProvider>,
    logs: SyncLogs,
    configs: SyncConfigurations,
    scheduler: Scheduler,
    counters: CoreCounters,
    initialized: AtomicBool,
}

impl CoreManager {
    /// Build the manager and connect both pools.
    ///
    /// A pool that cannot be reached here is fatal: the caller (the binary)
    /// exits non-zero.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = config.registry()?;

        let pools = DbPools::connect(
            &config.source_database.url,
            &config.source_database.pool,
            &config.target_database.url,
            &config.target_database.pool,
        )
        .await?;

        let reader = SourceReader::new(
            pools.source().clone(),
            config.sync.max_retries,
            config.sync.retry_delay,
            config.sync.source_query_timeout,
        );
        let writer = TargetWriter::new(pools.target().clone(), config.sync.target_query_timeout);
        let logs = SyncLogs::new(pools.target().clone());
        let configs = SyncConfigurations::new(pools.target().clone());
        let syncer = TableSyncer::new(
            reader.clone(),
            writer,
            SyncLogs::new(pools.target().clone()),
            SyncConfigurations::new(pools.target().clone()),
            config.sync.batch_size,
        );

        let provider = Arc::new(StaticConfigProvider::new(config.provider_overrides.clone()));
        let analytics = AnalyticsEngine::new(
            reader.clone(),
            UserAnalyticsRepo::new(pools.target().clone()),
            AffiliateAnalyticsRepo::new(pools.target().clone()),
            Arc::clone(&provider) as Arc<dyn ConfigProvider>,
        );

        let scheduler = Scheduler::new(config.schedule.clone())?;

        Ok(Arc::new(Self {
            config,
            pools,
            registry,
            reader,
            syncer,
            analytics,
            provider,
            logs,
            configs,
            scheduler,
            counters: CoreCounters::default(),
            initialized: AtomicBool::new(false),
        }))
    }

    /// One-time initialization: verify connectivity, run target migrations,
    /// seed the per-table configuration rows, start the scheduler.
    ///
    /// Idempotent after success; a failed attempt may be retried.
    #[instrument(skip(self), err)]
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("already initialized; skipping");
            return Ok(());
        }

        let result: Result<()> = async {
            self.pools.ping_both().await?;
            crate::migrator()
                .run(self.pools.target())
                .await
                .map_err(|e| Error::Other(anyhow::Error::from(e)))?;

            let tuning = SyncTuning {
                sync_interval_minutes: self.config.sync.sync_interval_minutes as i32,
                batch_size: self.config.sync.batch_size as i32,
                max_retries: self.config.sync.max_retries as i32,
                timeout_seconds: self.config.sync.source_query_timeout.as_secs() as i32,
            };
            for descriptor in self.registry.enabled() {
                self.configs.ensure(&descriptor.source_table, tuning).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.scheduler.start(Arc::clone(self) as Arc<dyn JobRunner>);
        info!(tables = self.registry.enabled().count(), "core manager initialized");
        Ok(())
    }

    /// The dynamic configuration provider, for operators pushing runtime
    /// changes (effective from the next batch or fire).
    pub fn provider(&self) -> &Arc<StaticConfigProvider> {
        &self.provider
    }

    /// Synchronous full sync over all enabled tables.
    pub async fn run_full_sync(&self) -> SyncSummary {
        self.run_sync_pass(SyncMode::Full, CancellationToken::new()).await
    }

    /// Synchronous incremental sync over tables with an incremental field.
    pub async fn run_incremental_sync(&self) -> SyncSummary {
        self.run_sync_pass(SyncMode::Incremental, CancellationToken::new()).await
    }

    /// Sync a single table. Configuration problems (unknown or disabled
    /// table, incremental without an incremental field) surface as `Err`.
    #[instrument(skip(self), err)]
    pub async fn sync_table(&self, table: &str, mode: SyncMode, opts: SyncOptions) -> Result<TableSyncReport> {
        let descriptor = self.registry.require(table)?.clone();
        let report = self.syncer.sync(&descriptor, mode, opts).await?;
        self.absorb_report(&report);
        Ok(report)
    }

    /// Manual cleanup pass.
    pub async fn run_cleanup(&self) -> Result<CleanupReport> {
        let export_retention = self.provider.export_settings().await.retention_days as i32;
        cleanup::run(
            self.pools.target(),
            &self.registry,
            self.config.sync.log_retention_days as i32,
            export_retention,
        )
        .await
    }

    pub async fn generate_user_analytics(
        &self,
        user_id: i64,
        period_type: PeriodType,
        reference: Option<DateTime<Utc>>,
    ) -> Result<Option<UserAnalytics>> {
        self.analytics.generate_user_analytics(user_id, period_type, reference).await
    }

    pub async fn generate_affiliate_analytics(
        &self,
        affiliate_id: i64,
        period_type: PeriodType,
        reference: Option<DateTime<Utc>>,
    ) -> Result<Option<AffiliateAnalytics>> {
        self.analytics
            .generate_affiliate_analytics(affiliate_id, period_type, reference)
            .await
    }

    /// Health, pool and scheduler snapshot.
    pub async fn status(&self) -> StatusReport {
        StatusReport {
            healthy: self.pools.ping_both().await.is_ok(),
            initialized: self.initialized.load(Ordering::SeqCst),
            source_pool: self.pools.source_stats(),
            target_pool: self.pools.target_stats(),
            scheduler: self.scheduler.status(),
            counters: CounterSnapshot {
                tables_synced: self.counters.tables_synced.load(Ordering::Relaxed),
                records_processed: self.counters.records_processed.load(Ordering::Relaxed),
                records_loaded: self.counters.records_loaded.load(Ordering::Relaxed),
                sync_failures: self.counters.sync_failures.load(Ordering::Relaxed),
            },
        }
    }

    /// Graceful shutdown: stop firing, drain in-flight jobs, close pools.
    pub async fn stop(&self) {
        info!("stopping core manager");
        self.scheduler.stop().await;
        self.pools.close().await;
        info!("core manager stopped");
    }

    /// Run the mapper pipeline over every table of a mode, sequentially,
    /// with the configured inter-table delay and a shared soft budget.
    fn run_sync_pass<'a>(
        &'a self,
        mode: SyncMode,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = SyncSummary> + Send + 'a>> {
        Box::pin(async move {
        let started = Instant::now();
        let (budget, delay) = match mode {
            SyncMode::Full => (self.config.sync.full_sync_budget, self.config.schedule.full_sync_table_delay),
            SyncMode::Incremental => (
                self.config.sync.incremental_sync_budget,
                self.config.schedule.incremental_table_delay,
            ),
        };
        let deadline = started + budget;

        let tables: Vec<TableDescriptor> = match mode {
            SyncMode::Full => self.registry.enabled().cloned().collect(),
            SyncMode::Incremental => self.registry.incremental().cloned().collect(),
        };

        let mut summary = SyncSummary {
            mode,
            reports: Vec::with_capacity(tables.len()),
            tables_succeeded: 0,
            tables_failed: 0,
            records_processed: 0,
            records_loaded: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        for (index, descriptor) in tables.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            if cancel.is_cancelled() {
                warn!(%mode, "sync pass cancelled; remaining tables skipped");
                break;
            }

            let opts = SyncOptions {
                deadline: Some(deadline),
                cancel: cancel.clone(),
                ..SyncOptions::default()
            };
            match self.syncer.sync(descriptor, mode, opts).await {
                Ok(report) => {
                    self.absorb_report(&report);
                    summary.records_processed += report.records_processed;
                    summary.records_loaded += report.load.loaded as u64;
                    if report.success {
                        summary.tables_succeeded += 1;
                    } else {
                        summary.tables_failed += 1;
                        if let Some(error) = &report.error {
                            summary.errors.push(format!("{}: {error}", report.table));
                        }
                    }
                    summary.reports.push(report);
                }
                Err(e) => {
                    // Table-level failure: account it and continue with the
                    // next table.
                    self.counters.sync_failures.fetch_add(1, Ordering::Relaxed);
                    summary.tables_failed += 1;
                    summary.errors.push(format!("{}: {e}", descriptor.source_table));
                    error!(table = %descriptor.source_table, %mode, "table sync errored: {e:#}");
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            %mode,
            tables = tables.len(),
            succeeded = summary.tables_succeeded,
            failed = summary.tables_failed,
            processed = summary.records_processed,
            loaded = summary.records_loaded,
            "sync pass finished"
        );
        summary
        })
    }

    fn absorb_report(&self, report: &TableSyncReport) {
        self.counters.tables_synced.fetch_add(1, Ordering::Relaxed);
        self.counters
            .records_processed
            .fetch_add(report.records_processed, Ordering::Relaxed);
        self.counters
            .records_loaded
            .fetch_add(report.load.loaded as u64, Ordering::Relaxed);
        if !report.success {
            self.counters.sync_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Scheduled post-sync aggregation: regenerate the configured rollup
    /// intervals for every source user and their affiliates, under one
    /// AGGREGATE audit row.
    fn run_aggregate_pass<'a>(
        &'a self,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let Some(users) = self.registry.get("users").filter(|d| d.enabled).cloned() else {
            warn!("users table not in registry; skipping aggregate pass");
            return Ok(());
        };

        let log_id = self.logs.start(SyncOperation::Aggregate, "scheduled", None).await?;
        let intervals = self.provider.analytics_settings().await.aggregation_intervals;

        let mut user_ids: Vec<i64> = Vec::new();
        let mut affiliate_ids: Vec<i64> = Vec::new();
        let scan = self
            .reader
            .read_all(&users, ReadOptions::full(self.config.sync.batch_size), async |rows| {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled {
                        operation: "aggregate pass".into(),
                    });
                }
                for row in rows {
                    if let Some(id) = row.get("id").and_then(|v| v.as_i64()) {
                        user_ids.push(id);
                    }
                    if let Some(id) = row.get("affiliate_id").and_then(|v| v.as_i64()) {
                        affiliate_ids.push(id);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = scan {
            self.logs.finalize(log_id, SyncLogOutcome::failed(e.to_string())).await?;
            return Err(e);
        }
        affiliate_ids.sort_unstable();
        affiliate_ids.dedup();

        let mut generated: i64 = 0;
        let mut failed: i64 = 0;
        for period_type in &intervals {
            for user_id in &user_ids {
                if cancel.is_cancelled() {
                    break;
                }
                match self.analytics.generate_user_analytics(*user_id, *period_type, None).await {
                    Ok(_) => generated += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(user_id, period = %period_type, "user aggregate failed: {e}");
                    }
                }
            }
            for affiliate_id in &affiliate_ids {
                if cancel.is_cancelled() {
                    break;
                }
                match self
                    .analytics
                    .generate_affiliate_analytics(*affiliate_id, *period_type, None)
                    .await
                {
                    Ok(_) => generated += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(affiliate_id, period = %period_type, "affiliate aggregate failed: {e}");
                    }
                }
            }
        }

        let outcome = if cancel.is_cancelled() {
            SyncLogOutcome::cancelled("shutdown during aggregate pass")
        } else {
            SyncLogOutcome::completed(generated + failed, generated, failed)
        };
        self.logs.finalize(log_id, outcome).await?;
        info!(generated, failed, "aggregate pass finished");
        Ok(())
        })
    }

}

#[async_trait]
impl JobRunner for CoreManager {
    /// The nightly job: full sync over every enabled table, then the
    /// post-sync aggregate pass, then cleanup.
    async fn run_full_sync(&self, cancel: CancellationToken) -> Result<()> {
        Box::pin(async move {
            let summary = self.run_sync_pass(SyncMode::Full, cancel.clone()).await;
            if !summary.errors.is_empty() {
                warn!(errors = summary.errors.len(), "full sync finished with table failures");
            }

            if !cancel.is_cancelled() {
                if let Err(e) = self.run_aggregate_pass(cancel.clone()).await {
                    error!("post-sync aggregate pass failed: {e:#}");
                }
            }
            if !cancel.is_cancelled() {
                if let Err(e) = self.run_cleanup().await {
                    error!("post-sync cleanup failed: {e:#}");
                }
            }
            Ok(())
        })
        .await
    }

    async fn run_incremental_sync(&self, cancel: CancellationToken) -> Result<()> {
        Box::pin(async move {
            self.run_sync_pass(SyncMode::Incremental, cancel).await;
            Ok(())
        })
        .await
    }

    async fn run_cleanup(&self, _cancel: CancellationToken) -> Result<()> {
        CoreManager::run_cleanup(self).await.map(|_| ())
    }
}
