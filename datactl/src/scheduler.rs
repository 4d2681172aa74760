//! Cron-driven job scheduling with an at-most-one-per-kind discipline.
//!
//! Three recurrences are owned here: the nightly full sync, the frequent
//! incremental sync, and the weekly cleanup. Expressions are standard cron
//! evaluated in the configured timezone.
//!
//! Each kind runs in its own task: compute the next occurrence, sleep until
//! it (or shutdown), then try to claim the kind. A fire that finds its kind
//! still running from a previous fire is logged and dropped, never queued —
//! `jobs_started` does not move for a dropped fire. Independent kinds may
//! overlap freely.
//!
//! [`Scheduler::stop`] cancels future fires immediately and then waits for
//! every in-flight job to finish (jobs observe the cancellation token at
//! their batch boundaries), so callers can close the pools afterwards.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ScheduleSettings;
use crate::errors::{Error, Result};

/// The scheduled job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullSync,
    IncrementalSync,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::FullSync, JobKind::IncrementalSync, JobKind::Cleanup];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::FullSync => "full_sync",
            JobKind::IncrementalSync => "incremental_sync",
            JobKind::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The work a scheduler fire dispatches into. Implemented by the core
/// manager; the scheduler itself knows nothing about tables or pools.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_full_sync(&self, cancel: CancellationToken) -> Result<()>;
    async fn run_incremental_sync(&self, cancel: CancellationToken) -> Result<()>;
    async fn run_cleanup(&self, cancel: CancellationToken) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct JobCounters {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

/// Shared scheduler state: the running-kinds set and the counters.
#[derive(Debug, Default)]
pub struct SchedulerState {
    running: Mutex<HashSet<JobKind>>,
    pub counters: JobCounters,
}

/// RAII claim on a job kind; releases the kind when dropped.
pub struct JobGuard {
    state: Arc<SchedulerState>,
    kind: JobKind,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.state.running.lock().expect("running set lock").remove(&self.kind);
    }
}

impl SchedulerState {
    /// Claim `kind` unless a previous fire of the same kind still runs.
    pub fn try_begin(self: &Arc<Self>, kind: JobKind) -> Option<JobGuard> {
        let mut running = self.running.lock().expect("running set lock");
        if running.contains(&kind) {
            return None;
        }
        running.insert(kind);
        Some(JobGuard {
            state: Arc::clone(self),
            kind,
        })
    }

    pub fn running_kinds(&self) -> Vec<JobKind> {
        let running = self.running.lock().expect("running set lock");
        let mut kinds: Vec<JobKind> = running.iter().copied().collect();
        kinds.sort_by_key(|k| k.name());
        kinds
    }

    /// Execute one fire of `kind` under the at-most-one-per-kind rule.
    ///
    /// Returns whether the fire actually ran. A dropped fire bumps only the
    /// `skipped` counter.
    pub async fn fire(self: &Arc<Self>, kind: JobKind, runner: &dyn JobRunner, cancel: CancellationToken) -> bool {
        let Some(guard) = self.try_begin(kind) else {
            warn!(job = %kind, "previous fire still running; dropping this fire");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!(job = %kind, "job started");

        let result = match kind {
            JobKind::FullSync => runner.run_full_sync(cancel).await,
            JobKind::IncrementalSync => runner.run_incremental_sync(cancel).await,
            JobKind::Cleanup => runner.run_cleanup(cancel).await,
        };
        drop(guard);

        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(job = %kind, "job completed");
                true
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(job = %kind, "job failed: {e:#}");
                true
            }
        }
    }
}

/// Point-in-time scheduler status for reporting.
#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub running: Vec<JobKind>,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
}

pub struct Scheduler {
    settings: ScheduleSettings,
    timezone: Tz,
    state: Arc<SchedulerState>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Validate the configured expressions and timezone up front so a typo
    /// fails initialization instead of silently never firing.
    pub fn new(settings: ScheduleSettings) -> Result<Self> {
        let timezone: Tz = settings
            .timezone
            .parse()
            .map_err(|_| Error::config(format!("unknown timezone '{}'", settings.timezone)))?;
        for kind in JobKind::ALL {
            let expr = settings.cron_for(kind);
            croner::Cron::from_str(expr)
                .map_err(|e| Error::config(format!("invalid cron expression '{expr}' for {kind}: {e}")))?;
        }
        Ok(Self {
            settings,
            timezone,
            state: Arc::new(SchedulerState::default()),
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the per-kind cron loops.
    pub fn start(&self, runner: Arc<dyn JobRunner>) {
        let mut handles = self.handles.lock().expect("handles lock");
        if !handles.is_empty() {
            warn!("scheduler already started");
            return;
        }
        for kind in JobKind::ALL {
            let expr = self.settings.cron_for(kind).to_string();
            let cron = croner::Cron::from_str(&expr).expect("validated in new()");
            let state = Arc::clone(&self.state);
            let runner = Arc::clone(&runner);
            let token = self.token.clone();
            let timezone = self.timezone;

            handles.push(tokio::spawn(async move {
                info!(job = %kind, cron = %expr, %timezone, "cron loop started");
                loop {
                    let now = chrono::Utc::now().with_timezone(&timezone);
                    let next = match cron.find_next_occurrence(&now, false) {
                        Ok(next) => next,
                        Err(e) => {
                            error!(job = %kind, "no next cron occurrence: {e}; stopping loop");
                            break;
                        }
                    };
                    let delay = (next - now).to_std().unwrap_or_default();

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => break,
                    }
                    if token.is_cancelled() {
                        break;
                    }
                    state.fire(kind, runner.as_ref(), token.child_token()).await;
                }
                info!(job = %kind, "cron loop stopped");
            }));
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.state.running_kinds(),
            jobs_started: self.state.counters.started.load(Ordering::Relaxed),
            jobs_completed: self.state.counters.completed.load(Ordering::Relaxed),
            jobs_failed: self.state.counters.failed.load(Ordering::Relaxed),
            jobs_skipped: self.state.counters.skipped.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.state.running_kinds().contains(&kind)
    }

    /// Stop firing immediately, then wait for in-flight jobs to drain.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handles lock");
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("scheduler task join failed: {e}");
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Runner that parks until released, counting concurrent entries.
    struct SlowRunner {
        entered: AtomicUsize,
        max_concurrent: AtomicUsize,
        release: tokio::sync::Notify,
    }

    impl SlowRunner {
        fn new() -> Self {
            Self {
                entered: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                release: tokio::sync::Notify::new(),
            }
        }

        async fn run(&self) -> Result<()> {
            let current = self.entered.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(current, Ordering::SeqCst);
            self.release.notified().await;
            self.entered.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl JobRunner for Arc<SlowRunner> {
        async fn run_full_sync(&self, _cancel: CancellationToken) -> Result<()> {
            self.run().await
        }
        async fn run_incremental_sync(&self, _cancel: CancellationToken) -> Result<()> {
            self.run().await
        }
        async fn run_cleanup(&self, _cancel: CancellationToken) -> Result<()> {
            self.run().await
        }
    }

    #[test]
    fn try_begin_enforces_at_most_one_per_kind() {
        let state = Arc::new(SchedulerState::default());

        let guard = state.try_begin(JobKind::FullSync).expect("first claim succeeds");
        assert!(state.try_begin(JobKind::FullSync).is_none());
        // Independent kinds may overlap.
        assert!(state.try_begin(JobKind::IncrementalSync).is_some());

        drop(guard);
        assert!(state.try_begin(JobKind::FullSync).is_some());
    }

    #[tokio::test]
    async fn overlapping_fire_is_dropped_without_counting_as_started() {
        let state = Arc::new(SchedulerState::default());
        let runner = Arc::new(SlowRunner::new());

        let first = tokio::spawn({
            let state = Arc::clone(&state);
            let runner = Arc::clone(&runner);
            async move { state.fire(JobKind::FullSync, &runner, CancellationToken::new()).await }
        });

        // Wait until the first fire is inside the runner.
        while runner.entered.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The colliding fire is dropped: not started, counted as skipped.
        let ran = state.fire(JobKind::FullSync, &runner, CancellationToken::new()).await;
        assert!(!ran);
        assert_eq!(state.counters.started.load(Ordering::SeqCst), 1);
        assert_eq!(state.counters.skipped.load(Ordering::SeqCst), 1);

        runner.release.notify_waiters();
        assert!(first.await.unwrap());
        assert_eq!(state.counters.completed.load(Ordering::SeqCst), 1);
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn independent_kinds_run_concurrently() {
        let state = Arc::new(SchedulerState::default());
        let runner = Arc::new(SlowRunner::new());

        let full = tokio::spawn({
            let state = Arc::clone(&state);
            let runner = Arc::clone(&runner);
            async move { state.fire(JobKind::FullSync, &runner, CancellationToken::new()).await }
        });
        let incremental = tokio::spawn({
            let state = Arc::clone(&state);
            let runner = Arc::clone(&runner);
            async move { state.fire(JobKind::IncrementalSync, &runner, CancellationToken::new()).await }
        });

        while runner.entered.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state.running_kinds().len(), 2);

        runner.release.notify_waiters();
        assert!(full.await.unwrap());
        assert!(incremental.await.unwrap());
        assert_eq!(state.counters.started.load(Ordering::SeqCst), 2);
        assert_eq!(state.running_kinds().len(), 0);
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scheduler_rejects_bad_cron_and_timezone() {
        let mut settings = ScheduleSettings::default();
        settings.full_sync_cron = "not a cron".into();
        assert!(Scheduler::new(settings).is_err());

        let mut settings = ScheduleSettings::default();
        settings.timezone = "Mars/Olympus_Mons".into();
        assert!(Scheduler::new(settings).is_err());
    }

    #[test]
    fn default_schedule_is_valid() {
        let scheduler = Scheduler::new(ScheduleSettings::default()).unwrap();
        let status = scheduler.status();
        assert!(status.running.is_empty());
        assert_eq!(status.jobs_started, 0);
    }
}
