//! Table descriptors: the schema-driven configuration of the pipeline.
//!
//! A descriptor declares everything a sync run needs to know about one
//! logical table. The tier-0 tables ship as a built-in registry; the config
//! file can disable tables, override their batch sizes, and contribute
//! additional descriptors for new source tables without a code change.
//!
//! Transformations reference registry *names* (see
//! [`crate::etl::transform`]), never closures, so a descriptor is plain data
//! that can round-trip through configuration.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Comparison operators accepted in filter objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl FilterOp {
    pub fn to_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Like => "LIKE",
        }
    }
}

/// One filter entry: a scalar equality, a membership list, or a map of
/// operator to value.
///
/// In YAML:
///
/// ```yaml
/// filters:
///   status: active                 # scalar     -> status = $n
///   payment_method: [pix, card]    # list       -> payment_method = ANY($n)
///   amount: { gte: 10, lt: 1000 }  # operators  -> amount >= $n AND amount < $m
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    List(Vec<serde_json::Value>),
    Ops(IndexMap<FilterOp, serde_json::Value>),
    Scalar(serde_json::Value),
}

/// Row-level validation rules, checked after mapping and coercion.
///
/// `unique` columns are not checked by the mapper; they are surfaced to the
/// writer as expected-unique columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub required: Vec<String>,
    pub email: Option<String>,
    pub numeric: Vec<String>,
    pub positive: Vec<String>,
    pub unique: Vec<String>,
}

/// Full description of one syncable table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDescriptor {
    /// Table read from the source database.
    pub source_table: String,
    /// Table written in the target database.
    pub target_table: String,
    /// Source primary key column; also the full-sync pagination order.
    pub primary_key: String,
    /// Target column carrying the upstream primary key; upsert lookup key.
    pub external_key: String,
    /// Source column driving incremental sync. Absent means the table
    /// supports full sync only.
    pub incremental_field: Option<String>,
    pub enabled: bool,
    /// Per-table batch size override; falls back to the global setting.
    pub batch_size: Option<usize>,
    /// source column -> target column. Unmapped source columns are dropped.
    pub field_mapping: IndexMap<String, String>,
    /// target column -> transform registry name.
    pub transformations: IndexMap<String, String>,
    /// source column -> filter, applied to every read.
    pub filters: IndexMap<String, FilterValue>,
    pub validations: ValidationRules,
}

impl Default for TableDescriptor {
    fn default() -> Self {
        Self {
            source_table: String::new(),
            target_table: String::new(),
            primary_key: "id".into(),
            external_key: String::new(),
            incremental_field: None,
            enabled: true,
            batch_size: None,
            field_mapping: IndexMap::new(),
            transformations: IndexMap::new(),
            filters: IndexMap::new(),
            validations: ValidationRules::default(),
        }
    }
}

impl TableDescriptor {
    /// Check every identifier the descriptor will splice into SQL.
    pub fn validate(&self) -> Result<()> {
        for ident in [&self.source_table, &self.target_table, &self.primary_key, &self.external_key] {
            check_identifier(ident)?;
        }
        if let Some(field) = &self.incremental_field {
            check_identifier(field)?;
        }
        for (source, target) in &self.field_mapping {
            check_identifier(source)?;
            check_identifier(target)?;
        }
        for column in self.filters.keys() {
            check_identifier(column)?;
        }
        if !self.field_mapping.values().any(|t| t == &self.external_key) {
            return Err(Error::config(format!(
                "table '{}': external key column '{}' is not produced by the field mapping",
                self.source_table, self.external_key
            )));
        }
        Ok(())
    }
}

/// Per-table knobs the config file may override without restating the whole
/// descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableOverride {
    pub table: String,
    pub enabled: Option<bool>,
    pub batch_size: Option<usize>,
}

/// The set of descriptors a process syncs, keyed by source table name.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: IndexMap<String, TableDescriptor>,
}

impl TableRegistry {
    /// Built-in descriptors merged with configuration overrides and extras.
    pub fn from_config(overrides: &[TableOverride], extra: &[TableDescriptor]) -> Result<Self> {
        let mut tables: IndexMap<String, TableDescriptor> = builtin_tables()
            .into_iter()
            .map(|t| (t.source_table.clone(), t))
            .collect();

        for descriptor in extra {
            descriptor.validate()?;
            tables.insert(descriptor.source_table.clone(), descriptor.clone());
        }

        for over in overrides {
            let Some(descriptor) = tables.get_mut(&over.table) else {
                return Err(Error::config(format!("table override references unknown table '{}'", over.table)));
            };
            if let Some(enabled) = over.enabled {
                descriptor.enabled = enabled;
            }
            if let Some(batch_size) = over.batch_size {
                if batch_size == 0 {
                    return Err(Error::config(format!("table '{}': batch_size must be > 0", over.table)));
                }
                descriptor.batch_size = Some(batch_size);
            }
        }

        Ok(Self { tables })
    }

    pub fn get(&self, source_table: &str) -> Option<&TableDescriptor> {
        self.tables.get(source_table)
    }

    /// Descriptor for a table, or a configuration error naming the table.
    pub fn require(&self, source_table: &str) -> Result<&TableDescriptor> {
        self.get(source_table)
            .ok_or_else(|| Error::config(format!("unknown table '{source_table}'")))
    }

    /// All enabled tables, in declaration order.
    pub fn enabled(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values().filter(|t| t.enabled)
    }

    /// Enabled tables that can sync incrementally.
    pub fn incremental(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.enabled().filter(|t| t.incremental_field.is_some())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Reject anything that is not a plain SQL identifier. Descriptor-supplied
/// names are spliced into queries (quoted), so this is the gate that keeps
/// configuration from smuggling SQL.
pub fn check_identifier(ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && ident.len() <= 63 {
        Ok(())
    } else {
        Err(Error::config(format!("invalid SQL identifier '{ident}'")))
    }
}

/// Quote a previously-checked identifier for splicing into SQL.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// The tier-0 tables: users, transactions, bets, deposits.
pub fn builtin_tables() -> Vec<TableDescriptor> {
    let users = TableDescriptor {
        source_table: "users".into(),
        target_table: "affiliates".into(),
        primary_key: "id".into(),
        external_key: "external_user_id".into(),
        incremental_field: Some("updated_at".into()),
        field_mapping: [
            ("id", "external_user_id"),
            ("name", "name"),
            ("email", "email"),
            ("phone", "phone"),
            ("status", "status"),
            ("mlm_level", "mlm_level"),
            ("affiliate_id", "parent_affiliate_id"),
            ("created_at", "registered_at"),
            ("updated_at", "source_updated_at"),
        ]
        .into_iter()
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .collect(),
        transformations: [
            ("status", "map_user_status"),
            ("phone", "clean_phone"),
            ("email", "normalize_email"),
        ]
        .into_iter()
        .map(|(c, t)| (c.to_string(), t.to_string()))
        .collect(),
        filters: [(
            "status".to_string(),
            FilterValue::Ops([(FilterOp::Ne, serde_json::json!("deleted"))].into_iter().collect()),
        )]
        .into_iter()
        .collect(),
        validations: ValidationRules {
            required: vec!["external_user_id".into(), "email".into()],
            email: Some("email".into()),
            numeric: vec!["external_user_id".into()],
            positive: vec!["external_user_id".into()],
            unique: vec!["external_user_id".into()],
        },
        ..TableDescriptor::default()
    };

    let transactions = TableDescriptor {
        source_table: "transactions".into(),
        target_table: "referrals".into(),
        primary_key: "id".into(),
        external_key: "external_transaction_id".into(),
        incremental_field: Some("updated_at".into()),
        field_mapping: [
            ("id", "external_transaction_id"),
            ("user_id", "external_user_id"),
            ("type", "transaction_type"),
            ("amount", "amount"),
            ("status", "status"),
            ("description", "description"),
            ("created_at", "transacted_at"),
            ("updated_at", "source_updated_at"),
        ]
        .into_iter()
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .collect(),
        transformations: [("status", "map_transaction_status"), ("amount", "cents_to_decimal")]
            .into_iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect(),
        validations: ValidationRules {
            required: vec!["external_transaction_id".into(), "external_user_id".into()],
            numeric: vec!["external_transaction_id".into(), "external_user_id".into(), "amount".into()],
            positive: vec!["amount".into()],
            unique: vec!["external_transaction_id".into()],
            ..ValidationRules::default()
        },
        ..TableDescriptor::default()
    };

    let bets = TableDescriptor {
        source_table: "bets".into(),
        target_table: "bet_activities".into(),
        primary_key: "id".into(),
        external_key: "external_bet_id".into(),
        incremental_field: Some("updated_at".into()),
        field_mapping: [
            ("id", "external_bet_id"),
            ("user_id", "external_user_id"),
            ("amount", "amount"),
            ("win_amount", "win_amount"),
            ("result", "result"),
            ("game", "game_type"),
            ("created_at", "placed_at"),
            ("updated_at", "source_updated_at"),
        ]
        .into_iter()
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .collect(),
        transformations: [("result", "lowercase"), ("amount", "cents_to_decimal"), ("win_amount", "cents_to_decimal")]
            .into_iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect(),
        validations: ValidationRules {
            required: vec!["external_bet_id".into(), "external_user_id".into()],
            numeric: vec!["external_bet_id".into(), "external_user_id".into(), "amount".into()],
            positive: vec!["amount".into()],
            unique: vec!["external_bet_id".into()],
            ..ValidationRules::default()
        },
        ..TableDescriptor::default()
    };

    let deposits = TableDescriptor {
        source_table: "deposits".into(),
        target_table: "deposit_records".into(),
        primary_key: "id".into(),
        external_key: "external_deposit_id".into(),
        incremental_field: Some("updated_at".into()),
        field_mapping: [
            ("id", "external_deposit_id"),
            ("user_id", "external_user_id"),
            ("amount", "amount"),
            ("method", "payment_method"),
            ("status", "status"),
            ("created_at", "deposited_at"),
            ("updated_at", "source_updated_at"),
        ]
        .into_iter()
        .map(|(s, t)| (s.to_string(), t.to_string()))
        .collect(),
        transformations: [("amount", "cents_to_decimal"), ("method", "lowercase")]
            .into_iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect(),
        filters: [(
            "status".to_string(),
            FilterValue::List(vec![serde_json::json!("confirmed"), serde_json::json!("completed")]),
        )]
        .into_iter()
        .collect(),
        validations: ValidationRules {
            required: vec!["external_deposit_id".into(), "external_user_id".into()],
            numeric: vec!["external_deposit_id".into(), "external_user_id".into(), "amount".into()],
            positive: vec!["amount".into()],
            unique: vec!["external_deposit_id".into()],
            ..ValidationRules::default()
        },
        ..TableDescriptor::default()
    };

    vec![users, transactions, bets, deposits]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_descriptors_are_valid() {
        for table in builtin_tables() {
            table.validate().unwrap_or_else(|e| panic!("{}: {e}", table.source_table));
            assert!(table.enabled);
            assert!(table.incremental_field.is_some());
        }
    }

    #[test]
    fn registry_applies_overrides() {
        let overrides = vec![TableOverride {
            table: "bets".into(),
            enabled: Some(false),
            batch_size: Some(100),
        }];
        let registry = TableRegistry::from_config(&overrides, &[]).unwrap();
        let bets = registry.get("bets").unwrap();
        assert!(!bets.enabled);
        assert_eq!(bets.batch_size, Some(100));
        assert_eq!(registry.enabled().count(), 3);
    }

    #[test]
    fn registry_rejects_unknown_override() {
        let overrides = vec![TableOverride {
            table: "nope".into(),
            enabled: Some(false),
            batch_size: None,
        }];
        assert!(TableRegistry::from_config(&overrides, &[]).is_err());
    }

    #[test]
    fn registry_rejects_zero_batch_size() {
        let overrides = vec![TableOverride {
            table: "users".into(),
            enabled: None,
            batch_size: Some(0),
        }];
        assert!(TableRegistry::from_config(&overrides, &[]).is_err());
    }

    #[test]
    fn identifier_check_blocks_injection() {
        assert!(check_identifier("updated_at").is_ok());
        assert!(check_identifier("_private").is_ok());
        assert!(check_identifier("users; DROP TABLE users").is_err());
        assert!(check_identifier("1starts_with_digit").is_err());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("col\"quote").is_err());
    }

    #[test]
    fn filter_value_deserializes_all_shapes() {
        let scalar: FilterValue = serde_json::from_value(serde_json::json!("active")).unwrap();
        assert!(matches!(scalar, FilterValue::Scalar(_)));

        let list: FilterValue = serde_json::from_value(serde_json::json!(["a", "b"])).unwrap();
        assert!(matches!(list, FilterValue::List(ref v) if v.len() == 2));

        let ops: FilterValue = serde_json::from_value(serde_json::json!({"gte": 10, "lt": 100})).unwrap();
        match ops {
            FilterValue::Ops(map) => {
                assert_eq!(map.len(), 2);
                assert!(map.contains_key(&FilterOp::Gte));
            }
            other => panic!("expected ops, got {other:?}"),
        }
    }

    #[test]
    fn descriptor_requires_mapped_external_key() {
        let mut desc = builtin_tables().remove(0);
        desc.field_mapping.shift_remove("id");
        assert!(desc.validate().is_err());
    }
}
