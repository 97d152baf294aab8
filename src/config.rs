//! Ingest engine configuration, loaded from TOML the way the teacher loads
//! `app.toml` / `timescale_db.toml`: deserialize, then `validate()` so bad
//! config fails fast at startup instead of surfacing as a confusing runtime
//! error later.

use serde::Deserialize;
use std::fs;

use crate::error::{IngestError, IngestResult};

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub partitioning: PartitioningConfig,
    pub shard: ShardConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitioningConfig {
    /// Number of partitions the cluster reports for a partitioned table.
    /// MP tables ignore this and always route to one shared shard.
    pub partition_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    /// Default trigger size for a loader that doesn't set its own.
    pub default_trigger_size: usize,
    /// Bounded queue capacity, expressed as a multiple of the trigger size
    /// in effect when the shard is created (spec §3: "capacity = 5 ×
    /// trigger size").
    pub queue_capacity_multiplier: usize,
    /// Whether newly created shards start in auto-reconnect mode.
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl IngestConfig {
    pub fn load(path: &str) -> IngestResult<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.partitioning.partition_count == 0 {
            return Err(IngestError::InvalidConfig(
                "partitioning.partition_count must be > 0".into(),
            ));
        }

        if self.shard.default_trigger_size == 0 {
            return Err(IngestError::InvalidConfig(
                "shard.default_trigger_size must be > 0".into(),
            ));
        }

        if self.shard.queue_capacity_multiplier == 0 {
            return Err(IngestError::InvalidConfig(
                "shard.queue_capacity_multiplier must be > 0".into(),
            ));
        }

        if self.metrics.enabled && self.metrics.bind_addr.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "metrics.bind_addr must not be empty when metrics.enabled is true".into(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "logging.level must not be empty".into(),
            ));
        }

        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            partitioning: PartitioningConfig { partition_count: 8 },
            shard: ShardConfig {
                default_trigger_size: 200,
                queue_capacity_multiplier: 5,
                auto_reconnect: true,
            },
            metrics: MetricsConfig {
                enabled: true,
                bind_addr: "0.0.0.0".into(),
                port: 9464,
                metrics_path: default_metrics_path(),
            },
            logging: LoggingConfig {
                level: "info".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        IngestConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_partition_count() {
        let mut cfg = IngestConfig::default();
        cfg.partitioning.partition_count = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, IngestError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_trigger_size() {
        let mut cfg = IngestConfig::default();
        cfg.shard.default_trigger_size = 0;
        assert!(cfg.validate().is_err());
    }
}
