//! Configuration management.
//!
//! dagflow configuration can come from:
//! - Built-in defaults
//! - Config file (~/.config/dagflow/config.toml)
//! - Environment variables (DAGFLOW_*)
//!
//! Later sources override earlier ones.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{
    BackoffStrategy, BackoffType, CircuitBreakerConfig, PoolConfig, RetryStrategy,
};
use crate::error::{Error, Result};
use crate::workflow::FailurePolicy;

/// dagflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler and worker pool
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default retry strategy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker defaults
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker count, i.e. max nodes running at once across executions
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Worker pool queue capacity
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,

    /// Whole-execution deadline applied when the workflow sets none
    #[serde(default)]
    pub execution_timeout_seconds: Option<u64>,

    /// Failure policy for workflows that don't choose one
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Write a state snapshot every N finished nodes
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,

    /// How long a stopping execution waits for in-flight nodes
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Wait before re-offering a node the pool rejected as full
    #[serde(default = "default_dispatch_retry_ms")]
    pub dispatch_retry_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            queue_size: default_queue_size(),
            result_buffer: default_result_buffer(),
            execution_timeout_seconds: None,
            failure_policy: FailurePolicy::default(),
            snapshot_interval: default_snapshot_interval(),
            cancel_grace_ms: default_cancel_grace_ms(),
            dispatch_retry_ms: default_dispatch_retry_ms(),
        }
    }
}

fn default_parallelism() -> usize {
    10
}

fn default_queue_size() -> usize {
    100
}

fn default_result_buffer() -> usize {
    100
}

fn default_snapshot_interval() -> usize {
    5
}

fn default_cancel_grace_ms() -> u64 {
    5000
}

fn default_dispatch_retry_ms() -> u64 {
    50
}

impl EngineConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_seconds.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn dispatch_retry(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_ms.max(1))
    }

    /// Worker pool settings derived from this section.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.parallelism.max(1),
            queue_size: self.queue_size.max(1),
            result_buffer: self.result_buffer.max(1),
            ..PoolConfig::default()
        }
    }
}

/// Retry configuration for the `"default"` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: BackoffType,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Per-attempt time limit
    #[serde(default)]
    pub attempt_timeout_seconds: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffType::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            attempt_timeout_seconds: None,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl RetryConfig {
    /// Build the default strategy. Keeps the built-in retry conditions.
    pub fn strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_retries: self.max_retries,
            backoff: BackoffStrategy {
                backoff_type: self.backoff,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                multiplier: self.multiplier,
                jitter: self.jitter,
            },
            timeout: self.attempt_timeout_seconds.map(Duration::from_secs),
            ..RetryStrategy::default()
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_max_half_open")]
    pub max_half_open_requests: u32,

    #[serde(default = "default_reset_interval")]
    pub reset_interval_seconds: u64,

    #[serde(default = "default_open_timeout")]
    pub open_timeout_seconds: u64,

    /// Trip when consecutive failures exceed this
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Overrides for `node_<type>` breakers
    #[serde(default)]
    pub node_type: NodeTypeBreakerSettings,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_half_open_requests: default_max_half_open(),
            reset_interval_seconds: default_reset_interval(),
            open_timeout_seconds: default_open_timeout(),
            failure_threshold: default_failure_threshold(),
            node_type: NodeTypeBreakerSettings::default(),
        }
    }
}

/// Node-type breaker overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeBreakerSettings {
    #[serde(default = "default_node_open_timeout")]
    pub open_timeout_seconds: u64,

    #[serde(default = "default_node_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for NodeTypeBreakerSettings {
    fn default() -> Self {
        Self {
            open_timeout_seconds: default_node_open_timeout(),
            failure_threshold: default_node_failure_threshold(),
        }
    }
}

fn default_max_half_open() -> u32 {
    3
}

fn default_reset_interval() -> u64 {
    60
}

fn default_open_timeout() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_node_open_timeout() -> u64 {
    30
}

fn default_node_failure_threshold() -> u32 {
    2
}

impl CircuitBreakerSettings {
    /// Template for generic keys.
    pub fn default_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new("default")
            .with_max_half_open_requests(self.max_half_open_requests)
            .with_reset_interval(Duration::from_secs(self.reset_interval_seconds))
            .with_open_timeout(Duration::from_secs(self.open_timeout_seconds))
            .trip_after(self.failure_threshold)
    }

    /// Template for `node_<type>` keys.
    pub fn node_type_config(&self) -> CircuitBreakerConfig {
        self.default_config()
            .with_open_timeout(Duration::from_secs(self.node_type.open_timeout_seconds))
            .trip_after(self.node_type.failure_threshold)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database; in-memory storage when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load an explicit config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let partial: PartialConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;

        let mut config = Self::default();
        config.apply_partial(partial);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("dagflow"))
            .unwrap_or_else(|| PathBuf::from(".dagflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("dagflow"))
            .unwrap_or_else(|| PathBuf::from(".dagflow"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(parsed) = lookup("DAGFLOW_PARALLELISM").and_then(|v| v.parse().ok()) {
            self.engine.parallelism = parsed;
        }
        if let Some(parsed) = lookup("DAGFLOW_QUEUE_SIZE").and_then(|v| v.parse().ok()) {
            self.engine.queue_size = parsed;
        }
        if let Some(parsed) =
            lookup("DAGFLOW_EXECUTION_TIMEOUT_SECONDS").and_then(|v| v.parse().ok())
        {
            self.engine.execution_timeout_seconds = Some(parsed);
        }
        if let Some(parsed) = lookup("DAGFLOW_FAILURE_POLICY").and_then(|v| v.parse().ok()) {
            self.engine.failure_policy = parsed;
        }
        if let Some(parsed) = lookup("DAGFLOW_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.retry.max_retries = parsed;
        }
        if let Some(path) = lookup("DAGFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(retry) = partial.retry {
            self.retry = retry;
        }
        if let Some(circuit_breaker) = partial.circuit_breaker {
            self.circuit_breaker = circuit_breaker;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    engine: Option<EngineConfig>,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerSettings>,
    storage: Option<StorageConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.parallelism, 10);
        assert_eq!(config.engine.queue_size, 100);
        assert_eq!(config.engine.snapshot_interval, 5);
        assert_eq!(config.engine.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.node_type.failure_threshold, 2);
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nparallelism = 4\nfailure_policy = \"continue\"\n\n[retry]\nbackoff = \"linear\"\nbase_delay_ms = 10"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.engine.parallelism, 4);
        assert_eq!(config.engine.queue_size, 100);
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);

        let strategy = config.retry.strategy();
        assert_eq!(strategy.backoff.backoff_type, BackoffType::Linear);
        assert_eq!(strategy.backoff.base_delay, Duration::from_millis(10));
        assert_eq!(strategy.max_retries, 3);
        assert!(!strategy.conditions.is_empty());
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nparallelism = ").unwrap();
        let err = Config::load_from(file.path()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let missing = Config::load_from(Path::new("/nonexistent/dagflow.toml")).unwrap_err();
        assert_eq!(missing.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DAGFLOW_PARALLELISM", "2"),
            ("DAGFLOW_EXECUTION_TIMEOUT_SECONDS", "90"),
            ("DAGFLOW_FAILURE_POLICY", "continue"),
            ("DAGFLOW_MAX_RETRIES", "not-a-number"),
            ("DAGFLOW_DATABASE_PATH", "/tmp/dagflow.db"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.engine.parallelism, 2);
        assert_eq!(config.engine.execution_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(
            config.storage.database_path,
            Some(PathBuf::from("/tmp/dagflow.db"))
        );
    }

    #[test]
    fn test_breaker_templates() {
        let settings = CircuitBreakerSettings::default();
        let node = settings.node_type_config();
        assert_eq!(node.open_timeout, Duration::from_secs(30));
        assert_eq!(node.max_half_open_requests, 3);

        let counts = crate::engine::Counts {
            consecutive_failures: 3,
            ..Default::default()
        };
        assert!((node.ready_to_trip)(&counts));
        assert!(!(settings.default_config().ready_to_trip)(&counts));
    }

    #[test]
    fn test_pool_config_from_engine() {
        let engine = EngineConfig {
            parallelism: 0,
            ..EngineConfig::default()
        };
        let pool = engine.pool_config();
        assert_eq!(pool.workers, 1);
        assert_eq!(pool.queue_size, 100);
    }
}
