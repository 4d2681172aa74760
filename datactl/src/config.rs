//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set with
//! the `-f` flag or the `DATACTL_CONFIG` environment variable.
//!
//! ## Loading priority
//!
//! Sources merge in order (later overrides earlier):
//!
//! 1. **YAML config file** - base configuration (missing file is fine; every
//!    field has a default)
//! 2. **Environment variables** - `DATACTL_`-prefixed, `__` for nesting
//!    (e.g. `DATACTL_SYNC__BATCH_SIZE=1000`)
//! 3. **`SOURCE_DATABASE_URL` / `TARGET_DATABASE_URL`** - special-cased
//!    overrides for the two connection strings
//!
//! ## Structure
//!
//! - `source_database` / `target_database`: connection URLs and pool sizing
//! - `schedule`: cron expressions, timezone, inter-table delays
//! - `sync`: batch size, retries, timeouts, soft budgets, log retention
//! - `tables` / `extra_tables`: overrides and additions to the built-in
//!   table registry
//! - `provider_overrides`: seed values for the runtime [`ConfigProvider`]
//!   keys (`cpa_level_amounts`, `cpa_validation_rules`, ...)
//!
//! [`ConfigProvider`]: crate::provider::ConfigProvider

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::etl::tables::{TableDescriptor, TableOverride, TableRegistry};
use crate::scheduler::JobKind;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DATACTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the service.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The operational database the pipeline reads from (read-only).
    pub source_database: DatabaseSettings,
    /// The analytics database the pipeline owns and writes to.
    pub target_database: DatabaseSettings,
    /// Cron schedules and timezone for the background jobs.
    pub schedule: ScheduleSettings,
    /// Pipeline tuning: batching, retries, timeouts, budgets.
    pub sync: SyncSettings,
    /// Per-table overrides of the built-in registry.
    pub tables: Vec<TableOverride>,
    /// Additional table descriptors beyond the built-ins.
    pub extra_tables: Vec<TableDescriptor>,
    /// Seed values for the runtime config provider, keyed by provider key.
    pub provider_overrides: HashMap<String, serde_json::Value>,
}

/// One database connection: URL plus pool sizing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool: PoolSettings,
}

/// Individual pool configuration with all SQLx parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

impl Default for PoolSettings {
    /// Production defaults: balanced for reliability and resource usage
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,  // 10 minutes
            max_lifetime_secs: 1800, // 30 minutes
        }
    }
}

/// Cron schedules for the three job kinds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSettings {
    /// Full sync over all enabled tables; cleanup runs afterwards.
    pub full_sync_cron: String,
    /// Incremental sync over tables with an incremental field.
    pub incremental_sync_cron: String,
    /// Orphan/retention/cache maintenance.
    pub cleanup_cron: String,
    /// IANA timezone the cron expressions are evaluated in.
    pub timezone: String,
    /// Pause between tables during a full sync, to limit source pressure.
    #[serde(with = "humantime_serde")]
    pub full_sync_table_delay: Duration,
    /// Pause between tables during an incremental sync.
    #[serde(with = "humantime_serde")]
    pub incremental_table_delay: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            full_sync_cron: "0 2 * * *".into(),
            incremental_sync_cron: "*/15 * * * *".into(),
            cleanup_cron: "0 3 * * 0".into(),
            timezone: "America/Sao_Paulo".into(),
            full_sync_table_delay: Duration::from_secs(5),
            incremental_table_delay: Duration::from_secs(2),
        }
    }
}

impl ScheduleSettings {
    pub fn cron_for(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::FullSync => &self.full_sync_cron,
            JobKind::IncrementalSync => &self.incremental_sync_cron,
            JobKind::Cleanup => &self.cleanup_cron,
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Default extract/load batch size; descriptors may override per table.
    pub batch_size: usize,
    /// Connection acquisition retries before a read fails.
    pub max_retries: u32,
    /// Delay between connection retries.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Per-query timeout on source reads.
    #[serde(with = "humantime_serde")]
    pub source_query_timeout: Duration,
    /// Per-query timeout on target writes.
    #[serde(with = "humantime_serde")]
    pub target_query_timeout: Duration,
    /// Soft budget for one full-sync job.
    #[serde(with = "humantime_serde")]
    pub full_sync_budget: Duration,
    /// Soft budget for one incremental-sync job.
    #[serde(with = "humantime_serde")]
    pub incremental_sync_budget: Duration,
    /// Days of `data_sync_logs` history the cleanup job keeps.
    pub log_retention_days: u32,
    /// Default cadence seeded into `sync_configurations` rows.
    pub sync_interval_minutes: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            source_query_timeout: Duration::from_secs(60),
            target_query_timeout: Duration::from_secs(120),
            full_sync_budget: Duration::from_secs(3600),
            incremental_sync_budget: Duration::from_secs(300),
            log_retention_days: 30,
            sync_interval_minutes: 15,
        }
    }
}

impl Config {
    /// Load configuration from the YAML file and environment.
    pub fn load(args: &Args) -> anyhow::Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("DATACTL_").split("__"))
            .extract()?;

        // Connection strings are commonly injected directly.
        if let Ok(url) = std::env::var("SOURCE_DATABASE_URL") {
            config.source_database.url = url;
        }
        if let Ok(url) = std::env::var("TARGET_DATABASE_URL") {
            config.target_database.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching a database.
    pub fn validate(&self) -> Result<()> {
        if self.source_database.url.trim().is_empty() {
            return Err(Error::config("source_database.url must be set"));
        }
        if self.target_database.url.trim().is_empty() {
            return Err(Error::config("target_database.url must be set"));
        }
        if self.sync.batch_size == 0 {
            return Err(Error::config("sync.batch_size must be > 0"));
        }
        if self.sync.sync_interval_minutes == 0 {
            return Err(Error::config("sync.sync_interval_minutes must be > 0"));
        }

        self.schedule
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| Error::config(format!("unknown timezone '{}'", self.schedule.timezone)))?;
        for kind in JobKind::ALL {
            let expr = self.schedule.cron_for(kind);
            croner::Cron::from_str(expr)
                .map_err(|e| Error::config(format!("invalid cron expression '{expr}' for {kind}: {e}")))?;
        }

        // Building the registry validates overrides and extra descriptors.
        self.registry()?;
        Ok(())
    }

    /// The table registry this configuration describes.
    pub fn registry(&self) -> Result<TableRegistry> {
        TableRegistry::from_config(&self.tables, &self.extra_tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(path: &str) -> Args {
        Args {
            config: path.into(),
            validate: false,
        }
    }

    #[test]
    fn defaults_are_complete_and_schedules_parse() {
        let config = Config::default();
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.schedule.timezone, "America/Sao_Paulo");
        assert_eq!(config.schedule.full_sync_cron, "0 2 * * *");
        assert_eq!(config.sync.full_sync_budget, Duration::from_secs(3600));
        assert_eq!(config.sync.incremental_sync_budget, Duration::from_secs(300));
        // Only the database URLs keep defaults from validating.
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_yaml_with_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
source_database:
  url: postgres://reader@source/ops
target_database:
  url: postgres://writer@target/analytics
  pool:
    max_connections: 20
sync:
  batch_size: 250
  retry_delay: 2s
schedule:
  incremental_sync_cron: "*/5 * * * *"
tables:
  - table: bets
    enabled: false
"#,
            )?;
            jail.set_env("DATACTL_SYNC__BATCH_SIZE", "100");

            let config = Config::load(&args_for("config.yaml")).expect("config loads");
            assert_eq!(config.source_database.url, "postgres://reader@source/ops");
            assert_eq!(config.target_database.pool.max_connections, 20);
            // Env beats YAML.
            assert_eq!(config.sync.batch_size, 100);
            assert_eq!(config.sync.retry_delay, Duration::from_secs(2));
            assert_eq!(config.schedule.incremental_sync_cron, "*/5 * * * *");

            let registry = config.registry().unwrap();
            assert!(!registry.get("bets").unwrap().enabled);
            Ok(())
        });
    }

    #[test]
    fn database_url_env_overrides_win() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
source_database:
  url: postgres://file@source/ops
target_database:
  url: postgres://file@target/analytics
"#,
            )?;
            jail.set_env("SOURCE_DATABASE_URL", "postgres://env@source/ops");

            let config = Config::load(&args_for("config.yaml")).expect("config loads");
            assert_eq!(config.source_database.url, "postgres://env@source/ops");
            assert_eq!(config.target_database.url, "postgres://file@target/analytics");
            Ok(())
        });
    }

    #[test]
    fn invalid_cron_fails_validation() {
        let mut config = Config::default();
        config.source_database.url = "postgres://s".into();
        config.target_database.url = "postgres://t".into();
        config.schedule.cleanup_cron = "every sunday".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_timezone_fails_validation() {
        let mut config = Config::default();
        config.source_database.url = "postgres://s".into();
        config.target_database.url = "postgres://t".into();
        config.schedule.timezone = "Not/AZone".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_table_override_fails_validation() {
        let mut config = Config::default();
        config.source_database.url = "postgres://s".into();
        config.target_database.url = "postgres://t".into();
        config.tables.push(TableOverride {
            table: "no_such_table".into(),
            enabled: Some(false),
            batch_size: None,
        });
        assert!(config.validate().is_err());
    }
}
