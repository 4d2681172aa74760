//! The extract stage: schema-driven batch reads from the source database.
//!
//! Every query is composed from a [`TableDescriptor`] plus per-call options.
//! Filter and watermark values are always bound parameters; the only strings
//! spliced into SQL are identifiers that passed
//! [`crate::etl::tables::check_identifier`].
//!
//! Pagination is plain `LIMIT`/`OFFSET` under a stable ordering: the
//! incremental field for incremental runs, the primary key for full runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument, warn};

use crate::errors::{Error, Result};
use crate::etl::tables::{FilterValue, TableDescriptor, check_identifier, quote_identifier};
use crate::etl::value::{Record, SqlValue, decode_row};

/// Options for one batch read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub batch_size: usize,
    pub offset: usize,
    /// Incremental lower bound; rows must have `incremental_field > watermark`.
    pub watermark: Option<DateTime<Utc>>,
    /// Explicit ordering column; defaults to the incremental field when a
    /// watermark is set, the primary key otherwise.
    pub order_by: Option<String>,
    /// Ad-hoc filters layered on top of the descriptor's own.
    pub extra_filters: IndexMap<String, FilterValue>,
}

impl ReadOptions {
    pub fn full(batch_size: usize) -> Self {
        Self {
            batch_size,
            offset: 0,
            watermark: None,
            order_by: None,
            extra_filters: IndexMap::new(),
        }
    }

    pub fn incremental(batch_size: usize, watermark: DateTime<Utc>) -> Self {
        Self {
            watermark: Some(watermark),
            ..Self::full(batch_size)
        }
    }
}

/// One page of extracted rows.
#[derive(Debug, Default)]
pub struct Batch {
    pub rows: Vec<Record>,
    /// True when the page was full, i.e. another page may exist.
    pub has_more: bool,
}

/// Streams rows out of the source database.
#[derive(Clone)]
pub struct SourceReader {
    pool: PgPool,
    max_retries: u32,
    retry_delay: Duration,
    query_timeout: Duration,
}

impl SourceReader {
    pub fn new(pool: PgPool, max_retries: u32, retry_delay: Duration, query_timeout: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_delay,
            query_timeout,
        }
    }

    /// Read one page. `has_more` is true iff the page came back full.
    #[instrument(skip(self, descriptor, opts), fields(table = %descriptor.source_table, offset = opts.offset), err)]
    pub async fn read_batch(&self, descriptor: &TableDescriptor, opts: &ReadOptions) -> Result<Batch> {
        let mut builder = build_read_query(descriptor, opts)?;
        let rows = self
            .fetch_with_retry(&mut builder, &descriptor.source_table)
            .await?;
        let has_more = rows.len() == opts.batch_size;
        let records = rows.iter().map(decode_row).collect::<Vec<_>>();
        debug!(rows = records.len(), has_more, "source batch read");
        Ok(Batch { rows: records, has_more })
    }

    /// Drive `on_batch` over every page until a short page ends the scan.
    ///
    /// The callback owns per-batch processing; an error from it aborts the
    /// scan and propagates, which is how sync deadlines and cancellation
    /// reach the reader.
    pub async fn read_all<F>(&self, descriptor: &TableDescriptor, opts: ReadOptions, mut on_batch: F) -> Result<()>
    where
        F: AsyncFnMut(Vec<Record>) -> Result<()>,
    {
        let mut opts = opts;
        loop {
            let batch = self.read_batch(descriptor, &opts).await?;
            let count = batch.rows.len();
            if count > 0 {
                on_batch(batch.rows).await?;
            }
            if !batch.has_more {
                return Ok(());
            }
            opts.offset += count;
        }
    }

    /// Fetch one row by primary key. Used by the analytics engine to resolve
    /// the entity under aggregation.
    #[instrument(skip(self), err)]
    pub async fn fetch_row(&self, table: &str, key_column: &str, key: i64) -> Result<Option<Record>> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE {} = ",
            quote_identifier(table),
            quote_identifier(key_column)
        ));
        builder.push_bind(key);
        let rows = self.fetch_with_retry(&mut builder, table).await?;
        Ok(rows.first().map(decode_row))
    }

    /// Fetch every row whose `key_column` equals `key`, ordered by primary
    /// key. Used by the affiliate engine to resolve a downline.
    #[instrument(skip(self), err)]
    pub async fn fetch_rows(&self, table: &str, key_column: &str, key: i64) -> Result<Vec<Record>> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE {} = ",
            quote_identifier(table),
            quote_identifier(key_column)
        ));
        builder.push_bind(key);
        builder.push(" ORDER BY id");
        let rows = self.fetch_with_retry(&mut builder, table).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    /// Fetch rows for a set of keys inside a closed time window, ordered by
    /// the window column. The workhorse of period aggregation.
    #[instrument(skip(self, keys), fields(keys = keys.len()), err)]
    pub async fn read_window(
        &self,
        table: &str,
        key_column: &str,
        keys: &[i64],
        date_column: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Record>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        check_identifier(table)?;
        check_identifier(key_column)?;
        check_identifier(date_column)?;

        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE {} = ANY(",
            quote_identifier(table),
            quote_identifier(key_column)
        ));
        builder.push_bind(keys.to_vec());
        builder.push(format!(") AND {col} >= ", col = quote_identifier(date_column)));
        builder.push_bind(from);
        builder.push(format!(" AND {col} <= ", col = quote_identifier(date_column)));
        builder.push_bind(to);
        builder.push(format!(" ORDER BY {col}", col = quote_identifier(date_column)));

        let rows = self.fetch_with_retry(&mut builder, table).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    /// Run the composed query with bounded connection retries and the
    /// source-side query timeout. A failure after the connection is
    /// established fails this batch only.
    async fn fetch_with_retry(
        &self,
        builder: &mut QueryBuilder<'_, Postgres>,
        table: &str,
    ) -> Result<Vec<sqlx::postgres::PgRow>> {
        let mut attempt = 0u32;
        let mut conn = loop {
            match self.pool.acquire().await {
                Ok(conn) => break conn,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        table,
                        attempt,
                        max = self.max_retries,
                        "source connection acquire failed: {e}; retrying in {:?}",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    return Err(Error::Connectivity {
                        operation: format!("acquire source connection for '{table}'"),
                        cause: anyhow::Error::from(e),
                    });
                }
            }
        };

        let query = builder.build();
        match tokio::time::timeout(self.query_timeout, query.fetch_all(&mut *conn)).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => Err(Error::Connectivity {
                operation: format!("read from source table '{table}'"),
                cause: anyhow::Error::from(e),
            }),
            Err(_) => Err(Error::Timeout {
                operation: format!("read from source table '{table}'"),
                timeout: self.query_timeout,
            }),
        }
    }
}

/// Compose the batch SELECT for a descriptor and options.
///
/// Exposed within the crate so the composition rules are testable without a
/// database.
pub(crate) fn build_read_query<'q>(descriptor: &TableDescriptor, opts: &ReadOptions) -> Result<QueryBuilder<'q, Postgres>> {
    check_identifier(&descriptor.source_table)?;
    let mut builder: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT * FROM {} WHERE 1=1", quote_identifier(&descriptor.source_table)));

    for (column, filter) in descriptor.filters.iter().chain(opts.extra_filters.iter()) {
        push_filter(&mut builder, column, filter)?;
    }

    if let (Some(watermark), Some(field)) = (opts.watermark, descriptor.incremental_field.as_deref()) {
        check_identifier(field)?;
        builder.push(format!(" AND {} > ", quote_identifier(field)));
        builder.push_bind(watermark);
    }

    let order_column = match (&opts.order_by, opts.watermark, &descriptor.incremental_field) {
        (Some(explicit), _, _) => explicit.clone(),
        (None, Some(_), Some(field)) => field.clone(),
        _ => descriptor.primary_key.clone(),
    };
    check_identifier(&order_column)?;
    builder.push(format!(" ORDER BY {}", quote_identifier(&order_column)));

    builder.push(" LIMIT ");
    builder.push_bind(opts.batch_size as i64);
    builder.push(" OFFSET ");
    builder.push_bind(opts.offset as i64);

    Ok(builder)
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, column: &str, filter: &FilterValue) -> Result<()> {
    check_identifier(column)?;
    let column = quote_identifier(column);
    match filter {
        FilterValue::Scalar(value) => {
            builder.push(format!(" AND {column} = "));
            SqlValue::from_json(value).push_bind(builder);
        }
        FilterValue::List(values) => {
            // A single array bind keeps membership lists of any length at one
            // parameter.
            builder.push(format!(" AND {column} = ANY("));
            let list: Vec<String> = values
                .iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            builder.push_bind(list);
            builder.push(")");
        }
        FilterValue::Ops(ops) => {
            for (op, value) in ops {
                builder.push(format!(" AND {column} {} ", op.to_sql()));
                SqlValue::from_json(value).push_bind(builder);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::tables::{FilterOp, builtin_tables};
    use chrono::TimeZone;

    fn users() -> TableDescriptor {
        builtin_tables().into_iter().find(|t| t.source_table == "users").unwrap()
    }

    #[test]
    fn full_read_orders_by_primary_key() {
        let sql_builder = build_read_query(&users(), &ReadOptions::full(500)).unwrap();
        let sql = sql_builder.sql();
        assert!(sql.starts_with("SELECT * FROM \"users\" WHERE 1=1"));
        // The builtin users filter: status <> 'deleted'.
        assert!(sql.contains("\"status\" <> $1"));
        assert!(sql.contains("ORDER BY \"id\""));
        assert!(sql.contains("LIMIT $2 OFFSET $3"));
        assert!(!sql.contains("updated_at"));
    }

    #[test]
    fn incremental_read_appends_watermark_and_orders_by_it() {
        let watermark = Utc.with_ymd_and_hms(2025, 3, 10, 10, 3, 0).unwrap();
        let sql_builder = build_read_query(&users(), &ReadOptions::incremental(10, watermark)).unwrap();
        let sql = sql_builder.sql();
        assert!(sql.contains("\"updated_at\" > $2"));
        assert!(sql.contains("ORDER BY \"updated_at\""));
    }

    #[test]
    fn explicit_order_by_wins() {
        let mut opts = ReadOptions::full(100);
        opts.order_by = Some("created_at".into());
        let sql_builder = build_read_query(&users(), &opts).unwrap();
        assert!(sql_builder.sql().contains("ORDER BY \"created_at\""));
    }

    #[test]
    fn list_filters_use_a_single_array_bind() {
        let deposits = builtin_tables().into_iter().find(|t| t.source_table == "deposits").unwrap();
        let sql_builder = build_read_query(&deposits, &ReadOptions::full(100)).unwrap();
        let sql = sql_builder.sql();
        assert!(sql.contains("\"status\" = ANY($1)"));
    }

    #[test]
    fn operator_filters_expand_per_entry() {
        let mut desc = users();
        desc.filters.clear();
        desc.filters.insert(
            "mlm_level".into(),
            FilterValue::Ops(
                [(FilterOp::Gte, serde_json::json!(1)), (FilterOp::Lte, serde_json::json!(5))]
                    .into_iter()
                    .collect(),
            ),
        );
        let sql_builder = build_read_query(&desc, &ReadOptions::full(100)).unwrap();
        let sql = sql_builder.sql();
        assert!(sql.contains("\"mlm_level\" >= $1"));
        assert!(sql.contains("\"mlm_level\" <= $2"));
    }

    #[test]
    fn extra_filters_are_appended_after_descriptor_filters() {
        let mut opts = ReadOptions::full(100);
        opts.extra_filters
            .insert("affiliate_id".into(), FilterValue::Scalar(serde_json::json!(7)));
        let sql_builder = build_read_query(&users(), &opts).unwrap();
        let sql = sql_builder.sql();
        assert!(sql.contains("\"status\" <> $1"));
        assert!(sql.contains("\"affiliate_id\" = $2"));
    }

    #[test]
    fn malicious_identifier_is_rejected() {
        let mut desc = users();
        desc.source_table = "users; DROP TABLE users".into();
        assert!(build_read_query(&desc, &ReadOptions::full(10)).is_err());

        let mut opts = ReadOptions::full(10);
        opts.order_by = Some("id; --".into());
        assert!(build_read_query(&users(), &opts).is_err());
    }
}
