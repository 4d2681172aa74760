//! # datactl: continuous ETL and analytics sync
//!
//! `datactl` continuously synchronizes operational data (users, transactions,
//! bets, deposits) from an upstream PostgreSQL database into a downstream
//! analytics database, and derives period-bucketed rollups for end-users and
//! their affiliates.
//!
//! ## Overview
//!
//! Operational databases are shaped for transactions, not analysis. Teams
//! that need affiliate dashboards, CPA qualification and period-over-period
//! metrics either hammer the production database with reporting queries or
//! maintain a second, analysis-shaped copy. `datactl` is that second copy's
//! keeper: a per-table configurable extract-transform-load pipeline plus an
//! aggregation engine, run on cron schedules with strict idempotence on the
//! target side.
//!
//! ### What it does
//!
//! On each scheduled fire the pipeline reads a batch of source rows (all of
//! them under the table's filters for a *full* sync, only rows newer than
//! the persisted watermark for an *incremental* sync), maps them through
//! field renames, named transform functions, default type coercions and
//! validation rules, and upserts the survivors into the target keyed by the
//! upstream primary key. Every attempt is accounted in `data_sync_logs`.
//! The analytics engine then folds the raw rows into one rollup row per
//! `(entity, period_type, period_start)` — deposits, bets, activity,
//! win/loss results and CPA qualification for users; downline counts, MLM
//! level populations, commissions and bounded rates for affiliates.
//!
//! ## Architecture
//!
//! Everything persists in PostgreSQL via [SQLx](https://github.com/launchbadge/sqlx):
//! two pools, one read-only against the source, one owning the target.
//!
//! The **pipeline layer** ([`etl`]) is schema-driven: table descriptors
//! declare mappings, transforms, filters and validations; queries are
//! composed at runtime with bound parameters. The **database layer**
//! ([`db`]) holds the pools and the repositories for the target-side
//! bookkeeping tables. The **analytics layer** ([`analytics`]) resolves
//! calendar periods, evaluates configurable CPA rules and upserts rollups
//! idempotently.
//!
//! **Background services**: the [`scheduler`] owns three timezone-bound cron
//! recurrences (nightly full sync, frequent incremental sync, weekly
//! cleanup) with an at-most-one-per-kind guarantee — a fire that overlaps a
//! still-running job of the same kind is dropped, never queued. The
//! [`manager::CoreManager`] facade ties it together: initialization,
//! health, manual sync entry points, status, graceful shutdown.
//!
//! ## Quick start
//!
//! ```no_run
//! use clap::Parser;
//! use datactl::{Config, CoreManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = datactl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     datactl::telemetry::init_telemetry();
//!
//!     let manager = CoreManager::connect(config).await?;
//!     manager.initialize().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Database setup
//!
//! Target-side migrations are embedded and run during initialization:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! datactl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The source database is never migrated or written; the pipeline requires
//! only read access to the tables named by its descriptors.
//!
//! ## Configuration
//!
//! See the [`config`] module for the file/environment surface and the
//! [`provider`] module for runtime-changeable values (CPA rules, export
//! retention, sync cadence).

pub mod analytics;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod errors;
pub mod etl;
pub mod manager;
pub mod provider;
pub mod scheduler;
pub mod telemetry;

pub use config::Config;
pub use errors::{Error, Result};
pub use manager::CoreManager;

/// Get the datactl target-database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
