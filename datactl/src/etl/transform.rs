//! The transform stage: rename, per-field transforms, default coercions,
//! validation, metadata.
//!
//! Mapping is a pure function of the input row (and the caller-supplied
//! clock): the same row always maps to the same record, which is what makes
//! rejected-row accounting and replays trustworthy.
//!
//! Per-field transforms are looked up by name in a static registry. A
//! transform that fails leaves the field at its pre-transform value and
//! records a warning; it never rejects the row. Validation is what rejects.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::etl::tables::TableDescriptor;
use crate::etl::value::{Record, SqlValue, parse_timestamp, record_to_json};

/// Metadata key attached to every mapped record.
pub const METADATA_FIELD: &str = "_etl_metadata";
/// Key carrying the descriptor's expected-unique columns to the writer.
pub const UNIQUE_FIELDS_FIELD: &str = "_unique_fields";

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"));

/// A pure, synchronous per-value transform. Receives the current value and
/// the full source row for context.
pub type TransformFn = fn(SqlValue, &Record) -> Result<SqlValue, String>;

static TRANSFORMS: Lazy<HashMap<&'static str, TransformFn>> = Lazy::new(|| {
    let mut registry: HashMap<&'static str, TransformFn> = HashMap::new();
    registry.insert("map_user_status", map_user_status);
    registry.insert("map_transaction_status", map_transaction_status);
    registry.insert("clean_phone", clean_phone);
    registry.insert("normalize_email", normalize_email);
    registry.insert("cents_to_decimal", cents_to_decimal);
    registry.insert("lowercase", lowercase);
    registry.insert("uppercase", uppercase);
    registry
});

/// Look up a transform by registry name.
pub fn transform_by_name(name: &str) -> Option<TransformFn> {
    TRANSFORMS.get(name).copied()
}

/// A row the mapper refused, with the reasons.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecord {
    pub source_row: serde_json::Value,
    pub errors: Vec<String>,
    pub rejected_at: DateTime<Utc>,
}

/// Accounting for one mapped batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MapStats {
    pub processed: usize,
    pub transformed: usize,
    pub rejected: usize,
}

impl MapStats {
    /// Share of rows that survived mapping. An empty input maps to 100.00:
    /// nothing was asked, nothing failed.
    pub fn success_rate_pct(&self) -> f64 {
        if self.processed == 0 {
            100.0
        } else {
            (self.transformed as f64 / self.processed as f64) * 100.0
        }
    }
}

/// Output of mapping one batch of source rows.
#[derive(Debug, Default)]
pub struct MappedBatch {
    pub records: Vec<Record>,
    pub rejected: Vec<RejectedRecord>,
    pub stats: MapStats,
}

/// Map a batch of source rows through the descriptor's pipeline.
///
/// `now` is injected by the caller so the mapping itself stays deterministic
/// (it stamps `transformed_at` and `rejected_at`).
pub fn map_batch(descriptor: &TableDescriptor, rows: Vec<Record>, now: DateTime<Utc>) -> MappedBatch {
    let mut out = MappedBatch {
        stats: MapStats {
            processed: rows.len(),
            ..MapStats::default()
        },
        ..MappedBatch::default()
    };

    for row in rows {
        match map_row(descriptor, &row, now) {
            Ok(record) => {
                out.stats.transformed += 1;
                out.records.push(record);
            }
            Err(errors) => {
                out.stats.rejected += 1;
                out.rejected.push(RejectedRecord {
                    source_row: record_to_json(&row),
                    errors,
                    rejected_at: now,
                });
            }
        }
    }

    out
}

/// Map a single row. Returns the mapped record, or the validation errors
/// that rejected it.
pub fn map_row(descriptor: &TableDescriptor, source_row: &Record, now: DateTime<Utc>) -> Result<Record, Vec<String>> {
    // 1. Rename: project through the field mapping; unmapped columns drop.
    let mut record = Record::with_capacity(descriptor.field_mapping.len() + 2);
    for (source_col, target_col) in &descriptor.field_mapping {
        let value = source_row.get(source_col).cloned().unwrap_or(SqlValue::Null);
        record.insert(target_col.clone(), value);
    }

    // 2. Per-field transforms. Failure keeps the pre-transform value.
    for (target_col, transform_name) in &descriptor.transformations {
        let Some(current) = record.get(target_col) else {
            continue;
        };
        let Some(transform) = transform_by_name(transform_name) else {
            warn!(
                table = %descriptor.source_table,
                field = %target_col,
                "unknown transform '{transform_name}', leaving value unchanged"
            );
            continue;
        };
        match transform(current.clone(), source_row) {
            Ok(next) => {
                record.insert(target_col.clone(), next);
            }
            Err(e) => {
                warn!(
                    table = %descriptor.source_table,
                    field = %target_col,
                    "transform '{transform_name}' failed: {e}; keeping original value"
                );
            }
        }
    }

    // 3. Default coercions, keyed off the target column names.
    for (column, value) in record.iter_mut() {
        *value = coerce(column, std::mem::replace(value, SqlValue::Null));
    }

    // 4. Validation.
    let errors = validate(descriptor, &record);
    if !errors.is_empty() {
        return Err(errors);
    }

    // 5. Metadata.
    let source_id = source_row
        .get(&descriptor.primary_key)
        .map(SqlValue::to_json)
        .unwrap_or(serde_json::Value::Null);
    record.insert(
        METADATA_FIELD.to_string(),
        SqlValue::Json(serde_json::json!({
            "source_table": descriptor.source_table,
            "target_table": descriptor.target_table,
            "transformed_at": now.to_rfc3339(),
            "source_id": source_id,
        })),
    );
    if !descriptor.validations.unique.is_empty() {
        record.insert(
            UNIQUE_FIELDS_FIELD.to_string(),
            SqlValue::Json(serde_json::json!(descriptor.validations.unique)),
        );
    }

    Ok(record)
}

/// Default coercions, applied after per-field transforms:
///
/// - strings are trimmed; empty strings become null
/// - `*_at`, `*_date` and `date_*` columns parse as timestamps
///   (unparseable values become null with a warning)
/// - `id`, `*_id` and `*amount*` columns coerce to numbers when possible
/// - the exact strings "true"/"false" (case-insensitive) become booleans
fn coerce(column: &str, value: SqlValue) -> SqlValue {
    let value = match value {
        SqlValue::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return SqlValue::Null;
            }
            SqlValue::Text(trimmed.to_string())
        }
        other => other,
    };

    if is_timestamp_column(column) {
        return match &value {
            SqlValue::Timestamp(_) | SqlValue::Null => value,
            SqlValue::Text(s) => match parse_timestamp(s) {
                Some(t) => SqlValue::Timestamp(t),
                None => {
                    warn!(column, "unparseable timestamp '{s}', coercing to null");
                    SqlValue::Null
                }
            },
            _ => {
                warn!(column, "non-temporal value in timestamp column, coercing to null");
                SqlValue::Null
            }
        };
    }

    if is_numeric_column(column) {
        if let SqlValue::Text(s) = &value {
            if let Ok(i) = s.parse::<i64>() {
                return SqlValue::Int(i);
            }
            if let Ok(d) = s.parse::<Decimal>() {
                return SqlValue::Decimal(d);
            }
        }
        return value;
    }

    if let SqlValue::Text(s) = &value {
        if s.eq_ignore_ascii_case("true") {
            return SqlValue::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return SqlValue::Bool(false);
        }
    }

    value
}

fn is_timestamp_column(column: &str) -> bool {
    column.ends_with("_at") || column.ends_with("_date") || column.starts_with("date_")
}

fn is_numeric_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id") || column.contains("amount")
}

fn validate(descriptor: &TableDescriptor, record: &Record) -> Vec<String> {
    let rules = &descriptor.validations;
    let mut errors = Vec::new();

    for field in &rules.required {
        if record.get(field).is_none_or(SqlValue::is_null_or_empty) {
            errors.push(format!("required field '{field}' is missing or empty"));
        }
    }

    if let Some(field) = &rules.email {
        if let Some(value) = record.get(field) {
            if let Some(text) = value.as_text() {
                if !EMAIL_RE.is_match(text) {
                    errors.push(format!("field '{field}' is not a valid email address: '{text}'"));
                }
            }
        }
    }

    for field in &rules.numeric {
        if let Some(value) = record.get(field) {
            if !value.is_null() && !value.is_numeric() {
                errors.push(format!("field '{field}' is not numeric"));
            }
        }
    }

    for field in &rules.positive {
        if let Some(value) = record.get(field) {
            if !value.is_null() {
                match value.as_decimal() {
                    Some(d) if d > Decimal::ZERO => {}
                    _ => errors.push(format!("field '{field}' must be positive")),
                }
            }
        }
    }

    errors
}

// ---------------------------------------------------------------------------
// Registry transforms
// ---------------------------------------------------------------------------

/// Normalize the operational user-status vocabulary (Portuguese and English
/// variants, numeric flags) into {active, inactive, blocked, pending}.
fn map_user_status(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    let normalized = match &value {
        SqlValue::Null => return Ok(SqlValue::Null),
        SqlValue::Bool(true) | SqlValue::Int(1) => "active".to_string(),
        SqlValue::Bool(false) | SqlValue::Int(0) => "inactive".to_string(),
        SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "active" | "ativo" | "enabled" => "active".to_string(),
            "inactive" | "inativo" | "disabled" => "inactive".to_string(),
            "blocked" | "bloqueado" | "banned" => "blocked".to_string(),
            "pending" | "pendente" => "pending".to_string(),
            other => other.to_string(),
        },
        other => return Err(format!("cannot map status from {other:?}")),
    };
    Ok(SqlValue::Text(normalized))
}

/// Normalize transaction statuses into {approved, pending, cancelled, refunded}.
fn map_transaction_status(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    let normalized = match &value {
        SqlValue::Null => return Ok(SqlValue::Null),
        SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "approved" | "aprovado" | "paid" | "pago" | "confirmed" => "approved".to_string(),
            "pending" | "pendente" | "processing" => "pending".to_string(),
            "cancelled" | "canceled" | "cancelado" => "cancelled".to_string(),
            "refunded" | "estornado" => "refunded".to_string(),
            other => other.to_string(),
        },
        other => return Err(format!("cannot map status from {other:?}")),
    };
    Ok(SqlValue::Text(normalized))
}

/// Strip formatting from phone numbers, keeping digits and a leading `+`.
fn clean_phone(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    match &value {
        SqlValue::Null => Ok(SqlValue::Null),
        SqlValue::Text(s) => {
            let plus = s.trim_start().starts_with('+');
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                Ok(SqlValue::Null)
            } else if plus {
                Ok(SqlValue::Text(format!("+{digits}")))
            } else {
                Ok(SqlValue::Text(digits))
            }
        }
        SqlValue::Int(i) => Ok(SqlValue::Text(i.to_string())),
        other => Err(format!("cannot clean phone from {other:?}")),
    }
}

fn normalize_email(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    match &value {
        SqlValue::Null => Ok(SqlValue::Null),
        SqlValue::Text(s) => Ok(SqlValue::Text(s.trim().to_ascii_lowercase())),
        other => Err(format!("cannot normalize email from {other:?}")),
    }
}

/// Integer cents into a two-decimal monetary amount. Values that already
/// carry decimals are assumed to be in currency units and pass through.
fn cents_to_decimal(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    match &value {
        SqlValue::Null => Ok(SqlValue::Null),
        SqlValue::Int(cents) => Ok(SqlValue::Decimal(Decimal::new(*cents, 2))),
        SqlValue::Decimal(_) | SqlValue::Float(_) => Ok(value),
        SqlValue::Text(s) => {
            let cents: i64 = s.trim().parse().map_err(|_| format!("'{s}' is not an integer cent amount"))?;
            Ok(SqlValue::Decimal(Decimal::new(cents, 2)))
        }
        other => Err(format!("cannot convert {other:?} to a monetary amount")),
    }
}

fn lowercase(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    match &value {
        SqlValue::Text(s) => Ok(SqlValue::Text(s.to_ascii_lowercase())),
        _ => Ok(value),
    }
}

fn uppercase(value: SqlValue, _row: &Record) -> Result<SqlValue, String> {
    match &value {
        SqlValue::Text(s) => Ok(SqlValue::Text(s.to_ascii_uppercase())),
        _ => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::tables::builtin_tables;
    use chrono::TimeZone;

    fn users_descriptor() -> TableDescriptor {
        builtin_tables().into_iter().find(|t| t.source_table == "users").unwrap()
    }

    fn source_user(id: i64, email: &str) -> Record {
        let mut row = Record::new();
        row.insert("id".into(), SqlValue::Int(id));
        row.insert("name".into(), SqlValue::Text("  Maria Silva  ".into()));
        row.insert("email".into(), SqlValue::Text(email.into()));
        row.insert("phone".into(), SqlValue::Text("+55 (11) 99999-0000".into()));
        row.insert("status".into(), SqlValue::Text("Ativo".into()));
        row.insert("mlm_level".into(), SqlValue::Int(1));
        row.insert("affiliate_id".into(), SqlValue::Int(7));
        row.insert(
            "created_at".into(),
            SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()),
        );
        row.insert("updated_at".into(), SqlValue::Text("2025-03-10 10:05:00".into()));
        row.insert("internal_notes".into(), SqlValue::Text("dropped".into()));
        row
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 14, 22, 0).unwrap()
    }

    #[test]
    fn maps_renames_transforms_and_coerces() {
        let desc = users_descriptor();
        let record = map_row(&desc, &source_user(42, " MARIA@Example.COM "), now()).unwrap();

        assert_eq!(record.get("external_user_id"), Some(&SqlValue::Int(42)));
        assert_eq!(record.get("name"), Some(&SqlValue::Text("Maria Silva".into())));
        assert_eq!(record.get("email"), Some(&SqlValue::Text("maria@example.com".into())));
        assert_eq!(record.get("phone"), Some(&SqlValue::Text("+5511999990000".into())));
        assert_eq!(record.get("status"), Some(&SqlValue::Text("active".into())));
        // Unmapped source columns are dropped.
        assert!(record.get("internal_notes").is_none());
        // The text timestamp was parsed by the *_at coercion.
        assert_eq!(
            record.get("source_updated_at"),
            Some(&SqlValue::Timestamp(Utc.with_ymd_and_hms(2025, 3, 10, 10, 5, 0).unwrap()))
        );
    }

    #[test]
    fn attaches_metadata_and_unique_fields() {
        let desc = users_descriptor();
        let record = map_row(&desc, &source_user(42, "a@b.co"), now()).unwrap();

        let SqlValue::Json(meta) = record.get(METADATA_FIELD).unwrap() else {
            panic!("metadata must be json");
        };
        assert_eq!(meta["source_table"], "users");
        assert_eq!(meta["target_table"], "affiliates");
        assert_eq!(meta["source_id"], 42);

        let SqlValue::Json(unique) = record.get(UNIQUE_FIELDS_FIELD).unwrap() else {
            panic!("unique fields must be json");
        };
        assert_eq!(unique, &serde_json::json!(["external_user_id"]));
    }

    #[test]
    fn rejects_invalid_email_and_keeps_row_details() {
        let desc = users_descriptor();
        let rows = vec![
            source_user(1, "ok@example.com"),
            source_user(2, "not-an-email"),
            source_user(3, "fine@example.com"),
        ];
        let batch = map_batch(&desc, rows, now());

        assert_eq!(batch.stats.processed, 3);
        assert_eq!(batch.stats.transformed, 2);
        assert_eq!(batch.stats.rejected, 1);
        let rejected = &batch.rejected[0];
        assert!(rejected.errors.iter().any(|e| e.contains("email")));
        assert_eq!(rejected.source_row["id"], 2);
        assert_eq!(rejected.rejected_at, now());
    }

    #[test]
    fn rejects_missing_required_field() {
        let desc = users_descriptor();
        let mut row = source_user(1, "a@b.co");
        row.insert("email".into(), SqlValue::Text("   ".into()));
        let errors = map_row(&desc, &row, now()).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("required field 'email'")));
    }

    #[test]
    fn failed_transform_keeps_original_value() {
        let desc = users_descriptor();
        let mut row = source_user(1, "a@b.co");
        // clean_phone cannot handle a bool; the value must survive untouched
        // (and the bool column name triggers no coercion).
        row.insert("phone".into(), SqlValue::Bool(true));
        let record = map_row(&desc, &row, now()).unwrap();
        assert_eq!(record.get("phone"), Some(&SqlValue::Bool(true)));
    }

    #[test]
    fn mapping_is_deterministic() {
        let desc = users_descriptor();
        let row = source_user(42, "a@b.co");
        let first = map_row(&desc, &row, now()).unwrap();
        let second = map_row(&desc, &row, now()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn success_rate_is_100_for_empty_input() {
        let stats = MapStats::default();
        assert_eq!(stats.success_rate_pct(), 100.0);

        let batch = map_batch(&users_descriptor(), Vec::new(), now());
        assert_eq!(batch.stats.success_rate_pct(), 100.0);
    }

    #[test]
    fn boolean_string_coercion() {
        assert_eq!(coerce("active_flag", SqlValue::Text("TRUE".into())), SqlValue::Bool(true));
        assert_eq!(coerce("active_flag", SqlValue::Text("false".into())), SqlValue::Bool(false));
        assert_eq!(coerce("name", SqlValue::Text("truely".into())), SqlValue::Text("truely".into()));
    }

    #[test]
    fn numeric_column_coercion() {
        assert_eq!(coerce("external_user_id", SqlValue::Text("42".into())), SqlValue::Int(42));
        assert_eq!(
            coerce("amount", SqlValue::Text("19.99".into())),
            SqlValue::Decimal(Decimal::new(1999, 2))
        );
        // Not coercible: left as text for validation to flag.
        assert_eq!(coerce("amount", SqlValue::Text("abc".into())), SqlValue::Text("abc".into()));
    }

    #[test]
    fn empty_string_becomes_null() {
        assert_eq!(coerce("name", SqlValue::Text("   ".into())), SqlValue::Null);
    }

    #[test]
    fn unparseable_timestamp_becomes_null() {
        assert_eq!(coerce("created_at", SqlValue::Text("soon".into())), SqlValue::Null);
    }

    #[test]
    fn cents_transform() {
        let row = Record::new();
        assert_eq!(
            cents_to_decimal(SqlValue::Int(1999), &row).unwrap(),
            SqlValue::Decimal(Decimal::new(1999, 2))
        );
        assert_eq!(
            cents_to_decimal(SqlValue::Decimal(Decimal::new(1999, 2)), &row).unwrap(),
            SqlValue::Decimal(Decimal::new(1999, 2))
        );
        assert!(cents_to_decimal(SqlValue::Text("abc".into()), &row).is_err());
    }

    #[test]
    fn status_transforms_normalize_vocabulary() {
        let row = Record::new();
        for (input, expected) in [("Ativo", "active"), ("BLOQUEADO", "blocked"), ("weird", "weird")] {
            assert_eq!(
                map_user_status(SqlValue::Text(input.into()), &row).unwrap(),
                SqlValue::Text(expected.into())
            );
        }
        assert_eq!(
            map_transaction_status(SqlValue::Text("Pago".into()), &row).unwrap(),
            SqlValue::Text("approved".into())
        );
    }
}
