//! Runtime configuration values with typed fallbacks.
//!
//! The pipeline's tunables (sync cadence, analytics retention, export
//! limits, CPA rules) come from a [`ConfigProvider`] rather than the static
//! config file, so an operator can change them without a restart. Jobs take
//! a snapshot of what they need when they start; a running batch never
//! observes a mid-flight change — updates apply from the next batch or fire.
//!
//! The default implementation, [`StaticConfigProvider`], serves values
//! seeded from the config file's `provider_overrides` section and swapped
//! atomically on update.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::analytics::cpa::{CpaLevelAmounts, CpaRuleSet};
use crate::db::models::analytics::PeriodType;

/// `data_sync_settings` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSyncSettings {
    pub sync_interval_minutes: u32,
    pub batch_size: u32,
    pub max_retry_attempts: u32,
    pub enable_real_time: bool,
    pub sync_tables: Vec<String>,
}

impl Default for DataSyncSettings {
    fn default() -> Self {
        Self {
            sync_interval_minutes: 15,
            batch_size: 500,
            max_retry_attempts: 3,
            enable_real_time: false,
            sync_tables: vec!["users".into(), "transactions".into(), "bets".into(), "deposits".into()],
        }
    }
}

/// `analytics_settings` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub retention_days: u32,
    pub aggregation_intervals: Vec<PeriodType>,
    pub enable_real_time_analytics: bool,
    pub cache_duration_minutes: u32,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            retention_days: 365,
            aggregation_intervals: vec![PeriodType::Daily, PeriodType::Weekly, PeriodType::Monthly],
            enable_real_time_analytics: false,
            cache_duration_minutes: 30,
        }
    }
}

/// `export_settings` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub max_file_size_mb: u32,
    pub retention_days: u32,
    pub allowed_formats: Vec<String>,
    pub compression_enabled: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            retention_days: 7,
            allowed_formats: vec!["CSV".into(), "JSON".into(), "XLSX".into()],
            compression_enabled: true,
        }
    }
}

/// Source of dynamic configuration values.
///
/// The typed getters fall back to their documented defaults when a key is
/// absent or fails to deserialize; a malformed override is logged, never
/// fatal.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Raw lookup of a configuration key.
    async fn get_value(&self, key: &str) -> Option<Value>;

    async fn data_sync_settings(&self) -> DataSyncSettings {
        typed(self.get_value("data_sync_settings").await, "data_sync_settings")
    }

    async fn analytics_settings(&self) -> AnalyticsSettings {
        typed(self.get_value("analytics_settings").await, "analytics_settings")
    }

    async fn export_settings(&self) -> ExportSettings {
        typed(self.get_value("export_settings").await, "export_settings")
    }

    async fn cpa_level_amounts(&self) -> CpaLevelAmounts {
        typed(self.get_value("cpa_level_amounts").await, "cpa_level_amounts")
    }

    async fn cpa_validation_rules(&self) -> CpaRuleSet {
        typed(self.get_value("cpa_validation_rules").await, "cpa_validation_rules")
    }
}

fn typed<T: serde::de::DeserializeOwned + Default>(value: Option<Value>, key: &str) -> T {
    match value {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("config key '{key}' is malformed ({e}); using defaults");
            T::default()
        }),
        None => T::default(),
    }
}

/// In-process provider over an atomically swapped key/value map.
pub struct StaticConfigProvider {
    values: ArcSwap<HashMap<String, Value>>,
}

impl StaticConfigProvider {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self {
            values: ArcSwap::from_pointee(values),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    /// Replace one key. Readers holding the previous snapshot are unaffected.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut next: HashMap<String, Value> = self.values.load().as_ref().clone();
        next.insert(key.into(), value);
        self.values.store(Arc::new(next));
    }

    pub fn remove(&self, key: &str) {
        let mut next: HashMap<String, Value> = self.values.load().as_ref().clone();
        next.remove(key);
        self.values.store(Arc::new(next));
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn get_value(&self, key: &str) -> Option<Value> {
        self.values.load().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn missing_keys_fall_back_to_defaults() {
        let provider = StaticConfigProvider::empty();
        let sync = provider.data_sync_settings().await;
        assert_eq!(sync.batch_size, 500);
        assert_eq!(sync.sync_tables.len(), 4);

        let amounts = provider.cpa_level_amounts().await;
        assert_eq!(amounts.level_1, Decimal::from(50));
    }

    #[tokio::test]
    async fn overrides_take_effect_and_can_change_at_runtime() {
        let provider = StaticConfigProvider::empty();
        provider.set("cpa_level_amounts", serde_json::json!({"level_1": "75.00"}));

        let amounts = provider.cpa_level_amounts().await;
        assert_eq!(amounts.level_1, Decimal::new(7500, 2));
        // Unspecified levels keep their defaults.
        assert_eq!(amounts.level_2, Decimal::from(20));

        provider.remove("cpa_level_amounts");
        assert_eq!(provider.cpa_level_amounts().await.level_1, Decimal::from(50));
    }

    #[tokio::test]
    async fn malformed_value_falls_back_to_defaults() {
        let provider = StaticConfigProvider::empty();
        provider.set("data_sync_settings", serde_json::json!({"batch_size": "not a number"}));
        let sync = provider.data_sync_settings().await;
        assert_eq!(sync.batch_size, 500);
    }
}
