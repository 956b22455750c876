//! Service configuration.
//!
//! Loaded once at boot from a YAML file and immutable afterwards. Durations
//! accept either bare seconds or suffixed strings ("30s", "5m", "1h").

pub mod duration;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::model::TableId;
use duration::deserialize_duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub batch_control: BatchControlConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub tables: TableFilterConfig,
    #[serde(default)]
    pub reload_coordination: ReloadConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let config: Config =
            serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.connection.dsn.is_empty() {
            anyhow::bail!("connection.dsn must not be empty");
        }
        if self.batch_control.max_batch_rows == 0 {
            anyhow::bail!("batch_control.max_batch_rows must be positive");
        }
        if self.batch_control.interval.is_zero() {
            anyhow::bail!("batch_control.interval must be positive");
        }
        if self.workers.max_export_workers == 0 {
            anyhow::bail!("workers.max_export_workers must be positive");
        }
        if self.tables.include_schemas.is_empty() {
            anyhow::bail!("tables.include_schemas must name at least one schema");
        }
        Ok(())
    }
}

/// Source database connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Connection string in key-value or URL form.
    pub dsn: String,
}

/// Replication slot and publication names, plus the table carrying captured
/// DDL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub slot_name: String,
    pub publication_name: String,
    /// Table populated by the DDL capture event trigger.
    pub ddl_history_table: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot_name: "data_mirror_slot".to_string(),
            publication_name: "data_mirror_pub".to_string(),
            ddl_history_table: "public.ddl_history".to_string(),
        }
    }
}

impl ReplicationConfig {
    pub fn ddl_history(&self) -> TableId {
        TableId::parse(&self.ddl_history_table)
    }
}

/// Flush cadence and batch bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchControlConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    pub max_batch_size_bytes: u64,
    pub max_batch_rows: u64,
}

impl Default for BatchControlConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_batch_size_bytes: 64 * 1024 * 1024,
            max_batch_rows: 100_000,
        }
    }
}

/// Output file store layout and compression.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub base_path: PathBuf,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    /// Emit an additional old-image row for updates when the replica
    /// identity provides one.
    #[serde(default)]
    pub emit_old_image: bool,
}

fn default_timestamp_format() -> String {
    "%Y-%m-%dT%H-%M-%S".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub algorithm: String,
    /// Level for streaming batches; full reloads always use best
    /// compression.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: "gzip".to_string(),
            level: 6,
        }
    }
}

/// Which tables are in scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TableFilterConfig {
    pub include_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub require_primary_key: bool,
}

impl Default for TableFilterConfig {
    fn default() -> Self {
        Self {
            include_schemas: vec!["public".to_string()],
            exclude_schemas: Vec::new(),
            require_primary_key: true,
        }
    }
}

/// Policy for changes arriving for a table while its reload is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaStrategy {
    /// Drop deltas; keep count and LSN range for reporting.
    Discard,
    /// Write accumulated deltas as a streaming batch after the reload ends.
    Apply,
    /// Drop deltas but reconcile the count for monitoring.
    Validate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Prefix a COMMENT body must carry to be treated as a reload marker.
    pub marker_prefix: String,
    pub delta_strategy: DeltaStrategy,
    #[serde(deserialize_with = "deserialize_duration")]
    pub operation_timeout: Duration,
    /// Export retries before a reload is abandoned.
    pub max_retries: u32,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            marker_prefix: "DATA_MIRROR::".to_string(),
            delta_strategy: DeltaStrategy::Discard,
            operation_timeout: Duration::from_secs(3600),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_export_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_export_workers: 4,
        }
    }
}

/// Registry placement and retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Dedicated schema, excluded from the publication.
    pub schema: String,
    /// Delete file records (and their directories) older than this many
    /// days. Disabled when unset.
    pub cleanup_after_days: Option<u32>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            schema: "data_mirror".to_string(),
            cleanup_after_days: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
connection:
  dsn: "host=localhost user=postgres dbname=app"
replication:
  slot_name: mirror_slot
batch_control:
  interval: 5s
  max_batch_rows: 1000
output:
  base_path: /data/mirror
  compression:
    algorithm: gzip
    level: 4
tables:
  include_schemas: [public, sales]
  exclude_schemas: [archive]
reload_coordination:
  marker_prefix: "MIRROR::"
  delta_strategy: apply
  operation_timeout: 30m
workers:
  max_export_workers: 2
registry:
  schema: mirror_meta
  cleanup_after_days: 14
"#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.replication.slot_name, "mirror_slot");
        // Defaults fill unspecified fields within a present section.
        assert_eq!(config.replication.publication_name, "data_mirror_pub");
        assert_eq!(config.batch_control.interval, Duration::from_secs(5));
        assert_eq!(config.batch_control.max_batch_rows, 1000);
        assert_eq!(config.output.compression.level, 4);
        assert_eq!(config.tables.include_schemas.len(), 2);
        assert_eq!(config.reload_coordination.delta_strategy, DeltaStrategy::Apply);
        assert_eq!(
            config.reload_coordination.operation_timeout,
            Duration::from_secs(1800)
        );
        assert_eq!(config.workers.max_export_workers, 2);
        assert_eq!(config.registry.schema, "mirror_meta");
        assert_eq!(config.registry.cleanup_after_days, Some(14));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let yaml = r#"
connection:
  dsn: "host=localhost"
output:
  base_path: /tmp/out
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.replication.slot_name, "data_mirror_slot");
        assert_eq!(config.batch_control.interval, Duration::from_secs(30));
        assert_eq!(
            config.reload_coordination.delta_strategy,
            DeltaStrategy::Discard
        );
        assert_eq!(config.output.timestamp_format, "%Y-%m-%dT%H-%M-%S");
        assert!(config.tables.require_primary_key);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let yaml = r#"
connection:
  dsn: ""
output:
  base_path: /tmp/out
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
