//! The load stage: transactional per-batch upserts into the target database.
//!
//! Each batch runs inside one transaction on one target connection. Rows are
//! keyed by the descriptor's external key (the upstream primary key carried
//! into the target): an existing row is updated in place, a new row is
//! inserted. A unique-constraint race on insert is counted as *skipped* and
//! the batch continues; any other row error rolls the whole batch back.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use sqlx::{Acquire, PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::db::errors::DbError;
use crate::errors::{Error, Result};
use crate::etl::tables::{TableDescriptor, check_identifier, quote_identifier};
use crate::etl::transform::{METADATA_FIELD, UNIQUE_FIELDS_FIELD};
use crate::etl::value::{Record, SqlValue};

/// Accounting for one load call.
///
/// `loaded = inserted + updated`. A rolled-back batch reports zero loads and
/// carries the failure in `errors`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub loaded: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl LoadStats {
    pub fn absorb(&mut self, other: &LoadStats) {
        self.loaded += other.loaded;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors.iter().cloned());
    }
}

/// Writes mapped records into target tables.
#[derive(Clone)]
pub struct TargetWriter {
    pool: PgPool,
    query_timeout: Duration,
}

impl TargetWriter {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self { pool, query_timeout }
    }

    /// Upsert one batch inside a single transaction.
    ///
    /// Returns `Ok` with the batch accounting in both the success and the
    /// rolled-back case: an integrity failure is a per-batch event the sync
    /// continues past, recorded in `errors`. Only transport-level failures
    /// (connection, timeout) return `Err`.
    #[instrument(skip(self, descriptor, records), fields(table = %descriptor.target_table, rows = records.len()), err)]
    pub async fn load_batch(&self, descriptor: &TableDescriptor, records: Vec<Record>) -> Result<LoadStats> {
        let mut stats = LoadStats::default();
        if records.is_empty() {
            return Ok(stats);
        }
        check_identifier(&descriptor.target_table)?;
        check_identifier(&descriptor.external_key)?;

        let mut tx = self.pool.begin().await.map_err(|e| Error::Connectivity {
            operation: format!("begin transaction on '{}'", descriptor.target_table),
            cause: anyhow::Error::from(e),
        })?;

        // External keys already written by this batch. A duplicate within
        // the batch goes straight to INSERT so the unique constraint decides
        // (and classifies it as skipped), instead of updating the row the
        // batch itself just wrote.
        let mut seen_keys: HashSet<String> = HashSet::new();

        for record in records {
            match self.write_row(&mut tx, descriptor, record, &mut seen_keys).await {
                Ok(RowOutcome::Inserted) => {
                    stats.inserted += 1;
                }
                Ok(RowOutcome::Updated) => {
                    stats.updated += 1;
                }
                Ok(RowOutcome::Skipped) => {
                    stats.skipped += 1;
                }
                Err(RowError::Integrity(message)) => {
                    // Roll back everything this batch wrote; the sync itself
                    // moves on to the next batch.
                    if let Err(e) = tx.rollback().await {
                        warn!("rollback after integrity failure also failed: {e}");
                    }
                    warn!(table = %descriptor.target_table, "batch rolled back: {message}");
                    return Ok(LoadStats {
                        errors: vec![message],
                        ..LoadStats::default()
                    });
                }
                Err(RowError::Fatal(err)) => {
                    let _ = tx.rollback().await;
                    return Err(err);
                }
            }
        }

        tx.commit().await.map_err(|e| Error::Connectivity {
            operation: format!("commit batch on '{}'", descriptor.target_table),
            cause: anyhow::Error::from(e),
        })?;

        stats.loaded = stats.inserted + stats.updated;
        debug!(
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            "target batch committed"
        );
        Ok(stats)
    }

    async fn write_row(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        descriptor: &TableDescriptor,
        mut record: Record,
        seen_keys: &mut HashSet<String>,
    ) -> std::result::Result<RowOutcome, RowError> {
        record.shift_remove(METADATA_FIELD);
        record.shift_remove(UNIQUE_FIELDS_FIELD);

        let Some(key_value) = record.get(&descriptor.external_key).cloned() else {
            return Err(RowError::Integrity(format!(
                "row is missing external key column '{}'",
                descriptor.external_key
            )));
        };
        if key_value.is_null() {
            return Err(RowError::Integrity(format!(
                "row has null external key '{}'",
                descriptor.external_key
            )));
        }
        for column in record.keys() {
            check_identifier(column).map_err(|e| RowError::Integrity(e.to_string()))?;
        }

        let table = quote_identifier(&descriptor.target_table);
        let key_column = quote_identifier(&descriptor.external_key);
        let duplicate_in_batch = !seen_keys.insert(key_value.to_json().to_string());

        // Lookup by external key decides insert vs update. Within-batch
        // duplicates bypass the lookup so the INSERT's unique constraint
        // classifies them.
        let existing: Option<Uuid> = if duplicate_in_batch {
            None
        } else {
            let mut lookup: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("SELECT id FROM {table} WHERE {key_column} = "));
            key_value.push_bind(&mut lookup);
            self.run(lookup.build_query_scalar::<Uuid>().fetch_optional(&mut **tx), "external key lookup")
                .await
                .map_err(RowError::from_db)?
        };

        match existing {
            Some(id) => {
                let mut update: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!("UPDATE {table} SET "));
                {
                    let mut assignments = update.separated(", ");
                    for (column, value) in &record {
                        assignments.push(format!("{} = ", quote_identifier(column)));
                        value.push_bind_unseparated(&mut assignments);
                    }
                    assignments.push("updated_at = now()");
                }
                update.push(" WHERE id = ");
                update.push_bind(id);
                self.run(update.build().execute(&mut **tx), "update").await.map_err(RowError::from_db)?;
                Ok(RowOutcome::Updated)
            }
            None => {
                let mut insert: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!("INSERT INTO {table} ("));
                {
                    let mut columns = insert.separated(", ");
                    for column in record.keys() {
                        columns.push(quote_identifier(column));
                    }
                }
                insert.push(") VALUES (");
                {
                    let mut values = insert.separated(", ");
                    for value in record.values() {
                        value.push_bind_separated(&mut values);
                    }
                }
                insert.push(")");

                // The insert runs under a savepoint: a 23505 must abort only
                // this row, not poison the batch transaction.
                let mut savepoint = tx.begin().await.map_err(|e| RowError::Fatal(e.into()))?;
                match self.run(insert.build().execute(&mut *savepoint), "insert").await {
                    Ok(_) => {
                        savepoint.commit().await.map_err(|e| RowError::Fatal(e.into()))?;
                        Ok(RowOutcome::Inserted)
                    }
                    Err(DbErrorKind::Unique) => {
                        savepoint.rollback().await.map_err(|e| RowError::Fatal(e.into()))?;
                        Ok(RowOutcome::Skipped)
                    }
                    Err(other) => {
                        let _ = savepoint.rollback().await;
                        Err(RowError::from_db(other))
                    }
                }
            }
        }
    }
}

enum RowOutcome {
    Inserted,
    Updated,
    Skipped,
}

enum RowError {
    /// Constraint-class failure: batch rolls back, sync continues.
    Integrity(String),
    /// Transport-class failure: escalates out of the writer.
    Fatal(Error),
}

impl RowError {
    fn from_db(kind: DbErrorKind) -> Self {
        match kind {
            DbErrorKind::Unique => RowError::Integrity("unexpected unique conflict outside insert".into()),
            DbErrorKind::Integrity(message) => RowError::Integrity(message),
            DbErrorKind::Fatal(err) => RowError::Fatal(err),
        }
    }
}

enum DbErrorKind {
    Unique,
    Integrity(String),
    Fatal(Error),
}

impl TargetWriter {
    /// Run one statement under the target-side timeout and classify the error.
    async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
        operation: &str,
    ) -> std::result::Result<T, DbErrorKind> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let db_err = DbError::from(e);
                match &db_err {
                    DbError::UniqueViolation { .. } => Err(DbErrorKind::Unique),
                    DbError::ForeignKeyViolation { message, .. } | DbError::CheckViolation { message, .. } => {
                        Err(DbErrorKind::Integrity(format!("{operation} violated a constraint: {message}")))
                    }
                    _ => Err(DbErrorKind::Fatal(Error::Database(db_err))),
                }
            }
            Err(_) => Err(DbErrorKind::Fatal(Error::Timeout {
                operation: format!("target {operation}"),
                timeout: self.query_timeout,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_absorb_accumulates() {
        let mut total = LoadStats::default();
        total.absorb(&LoadStats {
            loaded: 3,
            inserted: 2,
            updated: 1,
            skipped: 1,
            errors: vec![],
        });
        total.absorb(&LoadStats {
            loaded: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            errors: vec!["constraint".into()],
        });
        assert_eq!(total.loaded, 3);
        assert_eq!(total.inserted, 2);
        assert_eq!(total.updated, 1);
        assert_eq!(total.skipped, 1);
        assert_eq!(total.errors.len(), 1);
    }
}
