//! Crate configuration, loaded from TOML with field-level defaults — the
//! same shape as the teacher's `PerfConfig` (`performance/config.rs`):
//! `#[serde(default = "...")]` per field, a `Default` impl, and a `from_env`
//! override hook.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DataCenterError;
use crate::model::interval::UnknownIntervalTag;
use crate::model::Interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCenterConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_bar_intervals")]
    pub bar_intervals: Vec<String>,

    #[serde(default)]
    pub hot_store: HotStoreConfig,

    #[serde(default)]
    pub append_log: AppendLogConfig,

    #[serde(default)]
    pub event_bus: EventBusConfig,

    #[serde(default = "default_data_dir")]
    pub hot_store_dir: String,

    #[serde(default = "default_cold_dir")]
    pub cold_archive_dir: String,

    #[serde(default = "default_append_dir")]
    pub append_log_dir: String,

    #[serde(default = "default_instrument_table")]
    pub instrument_table_path: String,
}

fn default_retention_days() -> i64 {
    7
}
fn default_bar_intervals() -> Vec<String> {
    vec!["1m".to_string()]
}
fn default_data_dir() -> String {
    "data/hot".to_string()
}
fn default_cold_dir() -> String {
    "data/cold".to_string()
}
fn default_append_dir() -> String {
    "data/append".to_string()
}
fn default_instrument_table() -> String {
    "config/instruments.json".to_string()
}

impl Default for DataCenterConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            bar_intervals: default_bar_intervals(),
            hot_store: HotStoreConfig::default(),
            append_log: AppendLogConfig::default(),
            event_bus: EventBusConfig::default(),
            hot_store_dir: default_data_dir(),
            cold_archive_dir: default_cold_dir(),
            append_log_dir: default_append_dir(),
            instrument_table_path: default_instrument_table(),
        }
    }
}

impl DataCenterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DataCenterError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DataCenterError::Config(format!("reading config: {e}")))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| DataCenterError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let path = std::env::var("DATACENTER_CONFIG_PATH")
            .unwrap_or_else(|_| "datacenter.toml".to_string());
        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("using default datacenter config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Parses and validates the configured interval tags. Unknown tags are
    /// fatal at startup, per §6.1.
    pub fn parsed_intervals(&self) -> Result<Vec<Interval>, UnknownIntervalTag> {
        self.bar_intervals.iter().map(|t| Interval::parse(t)).collect()
    }

    fn validate(&self) -> Result<(), DataCenterError> {
        self.parsed_intervals()
            .map_err(|e| DataCenterError::Config(e.to_string()))?;
        if self.retention_days <= 0 {
            return Err(DataCenterError::Config(
                "retention_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotStoreConfig {
    #[serde(default = "default_tick_threshold")]
    pub tick_flush_threshold: usize,
    #[serde(default = "default_bar_threshold")]
    pub bar_flush_threshold: usize,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_max_thread_lifetime_secs")]
    pub max_flush_lifetime_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_tick_threshold() -> usize {
    10_000
}
fn default_bar_threshold() -> usize {
    3_000
}
fn default_monitor_interval_secs() -> u64 {
    5
}
fn default_max_thread_lifetime_secs() -> u64 {
    30
}
fn default_stop_timeout_secs() -> u64 {
    30
}

impl Default for HotStoreConfig {
    fn default() -> Self {
        Self {
            tick_flush_threshold: default_tick_threshold(),
            bar_flush_threshold: default_bar_threshold(),
            monitor_interval_secs: default_monitor_interval_secs(),
            max_flush_lifetime_secs: default_max_thread_lifetime_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_direct_write_wait_secs")]
    pub direct_write_wait_secs: u64,
}

fn default_worker_count() -> usize {
    4
}
fn default_batch_threshold() -> usize {
    500
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_direct_write_wait_secs() -> u64 {
    5
}

impl Default for AppendLogConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_threshold: default_batch_threshold(),
            queue_capacity: default_queue_capacity(),
            direct_write_wait_secs: default_direct_write_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_general_workers")]
    pub general_max_workers: usize,
    #[serde(default = "default_market_workers")]
    pub market_max_workers: usize,
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,
    #[serde(default = "default_soft_capacity")]
    pub soft_capacity: usize,
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
}

fn default_general_workers() -> usize {
    4
}
fn default_market_workers() -> usize {
    8
}
fn default_timer_interval_ms() -> u64 {
    1000
}
fn default_soft_capacity() -> usize {
    10_000
}
fn default_publish_retries() -> u32 {
    5
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            general_max_workers: default_general_workers(),
            market_max_workers: default_market_workers(),
            timer_interval_ms: default_timer_interval_ms(),
            soft_capacity: default_soft_capacity(),
            publish_retries: default_publish_retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = DataCenterConfig::default();
        assert!(cfg.parsed_intervals().is_ok());
    }

    #[test]
    fn unknown_interval_tag_is_rejected() {
        let mut cfg = DataCenterConfig::default();
        cfg.bar_intervals = vec!["7x".to_string()];
        assert!(cfg.parsed_intervals().is_err());
    }

    #[test]
    fn loads_overridden_thresholds_from_toml() {
        let toml_str = r#"
            retention_days = 3
            bar_intervals = ["1m", "5m", "1h"]

            [hot_store]
            tick_flush_threshold = 500
        "#;
        let cfg: DataCenterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.retention_days, 3);
        assert_eq!(cfg.hot_store.tick_flush_threshold, 500);
        assert_eq!(cfg.hot_store.bar_flush_threshold, default_bar_threshold());
    }
}
