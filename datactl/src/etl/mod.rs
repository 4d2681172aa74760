//! The extract-transform-load pipeline.
//!
//! Each syncable table is described by a [`tables::TableDescriptor`]: which
//! source table to read, which target table to write, how columns rename,
//! which named transforms and validations apply, and which target column
//! carries the upstream primary key (the *external key* used for upserts).
//!
//! A sync run wires the three stages together per table:
//!
//! ```text
//! SourceReader ──rows──▶ RecordMapper ──records──▶ TargetWriter
//!   (extract)             (transform)               (load)
//! ```
//!
//! [`syncer::TableSyncer`] orchestrates one table in either *full* mode
//! (paginated read of everything matching the filters) or *incremental* mode
//! (rows whose incremental field exceeds the persisted watermark), accounts
//! the run in `data_sync_logs`, and advances the watermark on success.

pub mod extract;
pub mod load;
pub mod syncer;
pub mod tables;
pub mod transform;
pub mod value;

use serde::Serialize;

/// How a table sync reads its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Complete read under the table's filters, paginated by primary key.
    Full,
    /// Bounded read of rows newer than the watermark.
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}
