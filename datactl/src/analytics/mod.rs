//! Period-bucketed aggregation over the raw operational data.
//!
//! The engine reads raw rows from the source (via the pipeline's
//! [`crate::etl::extract::SourceReader`]), computes the metric groups for a
//! calendar period, and upserts one rollup row per
//! `(entity, period_type, period_start)` into the target.
//!
//! - [`period`]: calendar resolution of `[period_start, period_end]`
//! - [`cpa`]: configurable CPA qualification rules and level payouts
//! - [`engine`]: the per-user and per-affiliate aggregation itself

pub mod cpa;
pub mod engine;
pub mod period;

pub use engine::AnalyticsEngine;
