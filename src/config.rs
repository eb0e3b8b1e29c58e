//! Runtime configuration, loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub maintenance: MaintenanceConfig,
    pub cdc: CdcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub polling_interval_ms: u64,
    pub max_concurrent_ops: usize,
    /// Slots compaction and flush may never occupy.
    pub reserved_log_gc_slots: usize,
    pub completed_ops_history: usize,
    /// Failures within `failure_window_ms` that mark a tablet degraded.
    pub failure_threshold: usize,
    pub failure_window_ms: u64,
    /// Candidates scoring at or below this are not runnable.
    pub min_score: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 250,
            max_concurrent_ops: 4,
            reserved_log_gc_slots: 1,
            completed_ops_history: 8,
            failure_threshold: 3,
            failure_window_ms: 300_000,
            min_score: 0.0,
        }
    }
}

impl MaintenanceConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Slots actually kept free for log-gc. With a single slot nothing can
    /// be reserved, so log-gc competes on score.
    pub fn effective_reserved_slots(&self) -> usize {
        if self.max_concurrent_ops <= 1 {
            0
        } else {
            self.reserved_log_gc_slots.min(self.max_concurrent_ops - 1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdcConfig {
    pub stream_inactivity_timeout_ms: u64,
    pub expiry_sweep_interval_ms: u64,
    pub max_records_per_poll: usize,
    /// JSON-lines checkpoint log; in-memory checkpoints when unset.
    pub checkpoint_log_path: Option<PathBuf>,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            stream_inactivity_timeout_ms: 86_400_000,
            expiry_sweep_interval_ms: 60_000,
            max_records_per_poll: 1_000,
            checkpoint_log_path: None,
        }
    }
}

impl CdcConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_interval_ms)
    }
}

impl RetentionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: RetentionConfig = serde_json::from_str(&raw)?;
        if let Some(log_path) = config.cdc.checkpoint_log_path.take() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.cdc.checkpoint_log_path = Some(if log_path.is_relative() {
                base.join(log_path)
            } else {
                log_path
            });
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maintenance.max_concurrent_ops == 0 {
            return Err(ConfigError::Invalid(
                "maintenance.max_concurrent_ops must be at least 1".into(),
            ));
        }
        if self.maintenance.max_concurrent_ops > 1
            && self.maintenance.reserved_log_gc_slots >= self.maintenance.max_concurrent_ops
        {
            return Err(ConfigError::Invalid(format!(
                "maintenance.reserved_log_gc_slots ({}) must be below max_concurrent_ops ({})",
                self.maintenance.reserved_log_gc_slots, self.maintenance.max_concurrent_ops
            )));
        }
        if self.maintenance.polling_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "maintenance.polling_interval_ms must be positive".into(),
            ));
        }
        if self.cdc.stream_inactivity_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "cdc.stream_inactivity_timeout_ms must be positive".into(),
            ));
        }
        if self.cdc.max_records_per_poll == 0 {
            return Err(ConfigError::Invalid(
                "cdc.max_records_per_poll must be positive".into(),
            ));
        }
        if self.cdc.expiry_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cdc.expiry_sweep_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
