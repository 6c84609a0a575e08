//! Database configuration
//!
//! Every section deserializes from JSON with per-field defaults, so an empty
//! object `{}` is a complete configuration. `Config::load` validates after
//! parsing; a configuration that fails validation is never returned.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid-configuration error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Read(_) => "QDB_CONFIG_READ",
            Self::Parse(_) => "QDB_CONFIG_PARSE",
            Self::Invalid(_) => "QDB_CONFIG_INVALID",
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub services: ServiceConfig,

    #[serde(default)]
    pub statistics: StatisticsConfig,

    #[serde(default)]
    pub rebuilder: RebuilderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.execution.dispatcher_threads == 0 {
            return Err(ConfigError::invalid("execution.dispatcher_threads must be > 0"));
        }
        if self.execution.service_threads == 0 {
            return Err(ConfigError::invalid("execution.service_threads must be > 0"));
        }
        if self.execution.transaction_history_size == 0 {
            return Err(ConfigError::invalid(
                "execution.transaction_history_size must be > 0",
            ));
        }
        if self.execution.max_staged_events == 0 {
            return Err(ConfigError::invalid("execution.max_staged_events must be > 0"));
        }

        let p = self.statistics.retention_probability;
        if !(p > 0.0 && p <= 1.0) {
            return Err(ConfigError::invalid(format!(
                "statistics.retention_probability must be in (0, 1], got {}",
                p
            )));
        }
        if self.statistics.persist_interval_ms == 0 {
            return Err(ConfigError::invalid("statistics.persist_interval_ms must be > 0"));
        }

        if self.rebuilder.grid_buckets == 0 {
            return Err(ConfigError::invalid("rebuilder.grid_buckets must be > 0"));
        }

        Ok(())
    }
}

/// Worker pools and transaction bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Threads of the pipeline dispatcher pool (default: available parallelism)
    #[serde(default = "default_dispatcher_threads")]
    pub dispatcher_threads: usize,

    /// Threads of the background service pool (default: 2)
    #[serde(default = "default_service_threads")]
    pub service_threads: usize,

    /// Finished transactions kept for reporting (default: 100)
    #[serde(default = "default_history_size")]
    pub transaction_history_size: usize,

    /// Maximum wait for a lock grant; `None` waits forever
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,

    /// Events a transaction may stage before its log is dropped (default: 100000)
    #[serde(default = "default_max_staged_events")]
    pub max_staged_events: usize,
}

fn default_dispatcher_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_service_threads() -> usize {
    2
}

fn default_history_size() -> usize {
    100
}

fn default_max_staged_events() -> usize {
    100_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dispatcher_threads: default_dispatcher_threads(),
            service_threads: default_service_threads(),
            transaction_history_size: default_history_size(),
            lock_timeout_ms: None,
            max_staged_events: default_max_staged_events(),
        }
    }
}

impl ExecutionConfig {
    /// Lock wait bound as a duration
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

/// Switches and delays of the background services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub auto_analyzer: bool,

    #[serde(default = "default_true")]
    pub auto_rebuilder: bool,

    #[serde(default = "default_true")]
    pub statistics_tracker: bool,

    #[serde(default = "default_true")]
    pub statistics_persister: bool,

    /// Delay before a scheduled task runs (default: 100ms)
    #[serde(default = "default_task_delay_ms")]
    pub task_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_task_delay_ms() -> u64 {
    100
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auto_analyzer: true,
            auto_rebuilder: true,
            statistics_tracker: true,
            statistics_persister: true,
            task_delay_ms: default_task_delay_ms(),
        }
    }
}

impl ServiceConfig {
    /// All services switched off
    pub fn disabled() -> Self {
        Self {
            auto_analyzer: false,
            auto_rebuilder: false,
            statistics_tracker: false,
            statistics_persister: false,
            ..Self::default()
        }
    }

    pub fn task_delay(&self) -> Duration {
        Duration::from_millis(self.task_delay_ms)
    }
}

/// Statistics tracking and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Changes per entity before statistics are recomputed (default: 1000)
    #[serde(default = "default_changes_threshold")]
    pub changes_threshold: u64,

    /// Seconds after the last change that force a recompute (default: 600)
    #[serde(default = "default_change_interval_secs")]
    pub change_interval_secs: u64,

    /// Probability that a row is fed to the collectors (default: 1.0)
    #[serde(default = "default_retention_probability")]
    pub retention_probability: f64,

    /// Period of the statistics persister (default: 60s)
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
}

fn default_changes_threshold() -> u64 {
    1000
}

fn default_change_interval_secs() -> u64 {
    600
}

fn default_retention_probability() -> f64 {
    1.0
}

fn default_persist_interval_ms() -> u64 {
    60_000
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            changes_threshold: default_changes_threshold(),
            change_interval_secs: default_change_interval_secs(),
            retention_probability: default_retention_probability(),
            persist_interval_ms: default_persist_interval_ms(),
        }
    }
}

impl StatisticsConfig {
    pub fn change_interval(&self) -> Duration {
        Duration::from_secs(self.change_interval_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

/// Index rebuild behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuilderConfig {
    /// Retries after a failed rebuild before the index is abandoned (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Added to the task delay for every retry (default: 100ms)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Buckets per dimension of newly created grid indexes (default: 8)
    #[serde(default = "default_grid_buckets")]
    pub grid_buckets: u16,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_grid_buckets() -> u16 {
    8
}

impl Default for RebuilderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            grid_buckets: default_grid_buckets(),
        }
    }
}

impl RebuilderConfig {
    /// Delay before retry number `attempt` (1-based), growing linearly
    pub fn retry_delay(&self, base: Duration, attempt: u32) -> Duration {
        base + Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "quarrydb=debug" (default: "info")
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_is_complete() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.service_threads, 2);
        assert_eq!(config.execution.transaction_history_size, 100);
        assert_eq!(config.rebuilder.max_retries, 3);
        assert_eq!(config.statistics.changes_threshold, 1000);
        assert_eq!(config.statistics.change_interval(), Duration::from_secs(600));
        assert_eq!(config.services.task_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"statistics": {{"changes_threshold": 5}}, "execution": {{"lock_timeout_ms": 250}}}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.statistics.changes_threshold, 5);
        assert_eq!(config.execution.lock_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.statistics.retention_probability, 1.0);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"statistics": {{"retention_probability": 0.0}}}}"#).unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert_eq!(err.code(), "QDB_CONFIG_INVALID");
    }

    #[test]
    fn test_malformed_json_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_retry_delay_grows_linearly() {
        let config = RebuilderConfig::default();
        let base = Duration::from_millis(100);
        assert_eq!(config.retry_delay(base, 1), Duration::from_millis(200));
        assert_eq!(config.retry_delay(base, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_services_disabled() {
        let config = ServiceConfig::disabled();
        assert!(!config.auto_analyzer);
        assert!(!config.statistics_persister);
        assert_eq!(config.task_delay_ms, 100);
    }
}
