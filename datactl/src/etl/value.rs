//! Typed scalar values for schema-driven rows.
//!
//! The pipeline never knows source schemas at compile time, so extracted rows
//! are ordered maps from column name to [`SqlValue`]. Decoding from a
//! [`PgRow`] is driven by the column's Postgres type; binding back into a
//! [`QueryBuilder`] is driven by the variant, so a value round-trips through
//! the pipeline without losing its database type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{Column, Postgres, QueryBuilder, Row, TypeInfo};
use uuid::Uuid;

/// An extracted row: ordered mapping from column name to scalar value.
pub type Record = IndexMap<String, SqlValue>;

/// A scalar cell value with its database type preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Null, or a string that is empty after trimming.
    pub fn is_null_or_empty(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SqlValue::Int(_) | SqlValue::Float(_) | SqlValue::Decimal(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Decimal(d) => d.to_i64(),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::Int(i) => Some(Decimal::from(*i)),
            SqlValue::Float(f) => Decimal::from_f64(*f),
            SqlValue::Decimal(d) => Some(*d),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Timestamp(t) => Some(*t),
            SqlValue::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Lossless-enough JSON form, used for `_etl_metadata`, rejected-row
    /// records and sync-log metadata. Decimals serialize as strings to keep
    /// their precision.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Bool(b) => serde_json::Value::Bool(*b),
            SqlValue::Int(i) => serde_json::Value::from(*i),
            SqlValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Decimal(d) => serde_json::Value::String(d.to_string()),
            SqlValue::Text(s) => serde_json::Value::String(s.clone()),
            SqlValue::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            SqlValue::Json(j) => j.clone(),
        }
    }

    /// Build a value from configuration-declared JSON (filter values and the
    /// like). Numbers become `Int` when integral, arrays and objects stay
    /// JSON.
    pub fn from_json(value: &serde_json::Value) -> SqlValue {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Json(other.clone()),
        }
    }

    /// Append this value to a query as a bound parameter. `Null` is pushed
    /// as a SQL literal so the parameter carries no bogus type hint.
    pub fn push_bind(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            SqlValue::Null => {
                qb.push("NULL");
            }
            SqlValue::Bool(b) => {
                qb.push_bind(*b);
            }
            SqlValue::Int(i) => {
                qb.push_bind(*i);
            }
            SqlValue::Float(f) => {
                qb.push_bind(*f);
            }
            SqlValue::Decimal(d) => {
                qb.push_bind(*d);
            }
            SqlValue::Text(s) => {
                qb.push_bind(s.clone());
            }
            SqlValue::Timestamp(t) => {
                qb.push_bind(*t);
            }
            SqlValue::Json(j) => {
                qb.push_bind(j.clone());
            }
        }
    }

    /// Like [`Self::push_bind`] but for comma-separated builders (VALUES
    /// lists, SET lists). The separator is emitted before the value.
    pub fn push_bind_separated(&self, sep: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlValue::Null => {
                sep.push("NULL");
            }
            SqlValue::Bool(b) => {
                sep.push_bind(*b);
            }
            SqlValue::Int(i) => {
                sep.push_bind(*i);
            }
            SqlValue::Float(f) => {
                sep.push_bind(*f);
            }
            SqlValue::Decimal(d) => {
                sep.push_bind(*d);
            }
            SqlValue::Text(s) => {
                sep.push_bind(s.clone());
            }
            SqlValue::Timestamp(t) => {
                sep.push_bind(*t);
            }
            SqlValue::Json(j) => {
                sep.push_bind(j.clone());
            }
        }
    }

    /// Append the value without a leading separator. Used after a fragment
    /// that already belongs to the current element, e.g. `col = ` in a SET
    /// list.
    pub fn push_bind_unseparated(&self, sep: &mut Separated<'_, '_, Postgres, &'static str>) {
        match self {
            SqlValue::Null => {
                sep.push_unseparated("NULL");
            }
            SqlValue::Bool(b) => {
                sep.push_bind_unseparated(*b);
            }
            SqlValue::Int(i) => {
                sep.push_bind_unseparated(*i);
            }
            SqlValue::Float(f) => {
                sep.push_bind_unseparated(*f);
            }
            SqlValue::Decimal(d) => {
                sep.push_bind_unseparated(*d);
            }
            SqlValue::Text(s) => {
                sep.push_bind_unseparated(s.clone());
            }
            SqlValue::Timestamp(t) => {
                sep.push_bind_unseparated(*t);
            }
            SqlValue::Json(j) => {
                sep.push_bind_unseparated(j.clone());
            }
        }
    }
}

/// Decode a dynamically-typed row into a [`Record`], preserving column order.
///
/// Unknown column types fall back to their text representation; a cell that
/// cannot be decoded at all becomes `Null` with a warning rather than failing
/// the whole batch.
pub fn decode_row(row: &PgRow) -> Record {
    let mut record = Record::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_cell(row, idx, column.type_info().name());
        record.insert(column.name().to_string(), value);
    }
    record
}

fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> SqlValue {
    let decoded = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(SqlValue::Bool)),
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(|i| SqlValue::Int(i64::from(i)))),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(|i| SqlValue::Int(i64::from(i)))),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(SqlValue::Int)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| v.map(|f| SqlValue::Float(f64::from(f)))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(SqlValue::Float)),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(idx).map(|v| v.map(SqlValue::Decimal)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map(SqlValue::Timestamp)),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|t| SqlValue::Timestamp(t.and_utc()))),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(idx).map(|v| {
            v.and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| SqlValue::Timestamp(t.and_utc()))
        }),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)
            .map(|v| v.map(|u| SqlValue::Text(u.to_string()))),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .map(|v| v.map(SqlValue::Json)),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| v.map(SqlValue::Text)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => SqlValue::Null,
        Err(e) => {
            // Fall back to text before giving up on the cell.
            match row.try_get::<Option<String>, _>(idx) {
                Ok(Some(s)) => SqlValue::Text(s),
                _ => {
                    tracing::warn!("failed to decode column {idx} ({type_name}): {e}");
                    SqlValue::Null
                }
            }
        }
    }
}

/// JSON object view of a record (used in rejected-row records and logs).
pub fn record_to_json(record: &Record) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> =
        record.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    serde_json::Value::Object(map)
}

/// Parse a timestamp from the handful of formats operational databases
/// actually emit: RFC 3339, space-separated datetime, bare date.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(t.and_utc());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn json_roundtrip_preserves_scalars() {
        assert_eq!(SqlValue::from_json(&serde_json::json!(42)), SqlValue::Int(42));
        assert_eq!(SqlValue::from_json(&serde_json::json!(2.5)), SqlValue::Float(2.5));
        assert_eq!(
            SqlValue::from_json(&serde_json::json!("abc")),
            SqlValue::Text("abc".into())
        );
        assert_eq!(SqlValue::from_json(&serde_json::Value::Null), SqlValue::Null);
        assert_eq!(SqlValue::Int(42).to_json(), serde_json::json!(42));
    }

    #[test]
    fn decimal_serializes_as_string() {
        let d = SqlValue::Decimal(Decimal::new(1999, 2));
        assert_eq!(d.to_json(), serde_json::json!("19.99"));
    }

    #[test]
    fn parse_timestamp_accepts_common_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 10, 14, 22, 0).unwrap();
        assert_eq!(parse_timestamp("2025-03-10T14:22:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-10 14:22:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-10T14:22:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2025-03-10"),
            Some(Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("not a date"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn null_and_empty_detection() {
        assert!(SqlValue::Null.is_null_or_empty());
        assert!(SqlValue::Text("   ".into()).is_null_or_empty());
        assert!(!SqlValue::Text("x".into()).is_null_or_empty());
        assert!(!SqlValue::Int(0).is_null_or_empty());
    }

    #[test]
    fn numeric_coercions() {
        assert_eq!(SqlValue::Text("19.99".into()).as_decimal(), Some(Decimal::new(1999, 2)));
        assert_eq!(SqlValue::Int(7).as_decimal(), Some(Decimal::from(7)));
        assert_eq!(SqlValue::Text("abc".into()).as_decimal(), None);
        assert_eq!(SqlValue::Float(3.0).as_i64(), Some(3));
        assert_eq!(SqlValue::Float(3.5).as_i64(), None);
    }
}
