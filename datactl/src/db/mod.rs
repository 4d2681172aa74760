//! Database layer for the sync service.
//!
//! The service talks to two PostgreSQL databases: the **source** (the
//! operational database it reads from, strictly read-only) and the **target**
//! (the analytics database it owns and mutates). Both are SQLx connection
//! pools wrapped in [`pools::DbPools`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   Pipeline   │  (etl / analytics / cleanup)
//! └──────┬───────┘
//!        │
//!        ↓
//! ┌──────────────┐
//! │ Repositories │  (db::handlers - queries & upserts)
//! └──────┬───────┘
//!        │
//!        ↓
//! ┌──────────────┐
//! │    Models    │  (db::models - persisted records)
//! └──────┬───────┘
//!        │
//!   ┌────┴─────┐
//!   ↓          ↓
//! ┌────────┐ ┌────────┐
//! │ source │ │ target │
//! └────────┘ └────────┘
//! ```
//!
//! # Modules
//!
//! - [`pools`]: the source/target pool pair with health checks
//! - [`handlers`]: repositories for the target-side bookkeeping tables
//! - [`models`]: record structures matching the target schema
//! - [`errors`]: database-specific error classification
//!
//! Repositories here only ever touch the target database. Reads from the
//! source go through [`crate::etl::extract::SourceReader`], which composes
//! its queries from table descriptors instead of a fixed schema.

pub mod errors;
pub mod handlers;
pub mod models;
pub mod pools;
