use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::utils::{CircuitBreakerConfig, RetryConfig};

// ============================================================================
// Application Configuration
// ============================================================================
//
// Layers, lowest precedence first:
//   1. config/default.toml
//   2. the file named by ORDER_PIPELINE_CONFIG (optional)
//   3. ORDER_PIPELINE__SECTION__KEY environment variables
//
// ============================================================================

pub const CONFIG_PATH_VAR: &str = "ORDER_PIPELINE_CONFIG";
const ENV_PREFIX: &str = "ORDER_PIPELINE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub ledger: LedgerConfig,
    pub dead_letter: DeadLetterConfig,
    pub consumer_retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Scylla,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub known_nodes: Vec<String>,
    pub keyspace: String,
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Redpanda,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub brokers: String,
    pub consumer_group: String,
    pub publish_timeout_ms: u64,
    pub batch_size: usize,
    pub batch_linger_ms: u64,
}

impl QueueConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub redis_url: String,
    /// Retention of `done` markers.
    pub ttl_secs: u64,
    /// Lifetime of an `in_progress` marker; an interrupted worker's key can
    /// be claimed again once it lapses.
    pub lease_ms: u64,
}

impl LedgerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterBackend {
    Scylla,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    pub backend: DeadLetterBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: s.max_attempts,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            multiplier: s.multiplier,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub success_threshold: u32,
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            open_timeout: Duration::from_secs(s.open_timeout_secs),
            success_threshold: s.success_threshold,
        }
    }
}

/// `[routing.queues]`: status name to queue (topic) name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub queues: HashMap<String, String>,
}

impl AppConfig {
    /// Load from the default file, the optional override file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false));

        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            tracing::info!(path = %path, "Loading configuration override file");
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("store.known_nodes"),
            )
            .build()?
            .try_deserialize::<AppConfig>()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly, bypassing files and environment.
    #[cfg(test)]
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize::<AppConfig>()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::Invalid("store.timeout_ms must be positive".into()));
        }
        if self.queue.publish_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "queue.publish_timeout_ms must be positive".into(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be positive".into()));
        }
        if self.consumer_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "consumer_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.consumer_retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "consumer_retry.multiplier must be >= 1.0".into(),
            ));
        }
        if self.ledger.lease_ms == 0 {
            return Err(ConfigError::Invalid("ledger.lease_ms must be positive".into()));
        }
        if self.ledger.lease_ms >= self.ledger.ttl_secs.saturating_mul(1000) {
            return Err(ConfigError::Invalid(
                "ledger.lease_ms must be shorter than ledger.ttl_secs".into(),
            ));
        }
        let uses_scylla = self.store.backend == StoreBackend::Scylla
            || self.dead_letter.backend == DeadLetterBackend::Scylla;
        if uses_scylla && self.store.known_nodes.is_empty() {
            return Err(ConfigError::Invalid("store.known_nodes is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 8080

[store]
backend = "memory"
known_nodes = []
keyspace = "orders_ks"
timeout_ms = 2000

[queue]
backend = "memory"
brokers = "127.0.0.1:9092"
consumer_group = "order-status-consumers"
publish_timeout_ms = 5000
batch_size = 10
batch_linger_ms = 200

[ledger]
backend = "memory"
redis_url = "redis://127.0.0.1:6379"
ttl_secs = 604800
lease_ms = 30000

[dead_letter]
backend = "memory"

[consumer_retry]
max_attempts = 3
initial_delay_ms = 100
max_delay_ms = 10000
multiplier = 2.0

[circuit_breaker]
failure_threshold = 5
open_timeout_secs = 30
success_threshold = 3

[routing.queues]
received = "received-queue"
inprocess = "inprocess-queue"
completed = "completed-queue"
canceled = "canceled-queue"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_toml(TEST_CONFIG).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_secs(2));
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.ledger.backend, LedgerBackend::Memory);
        assert_eq!(config.ledger.lease(), Duration::from_secs(30));
        assert_eq!(config.ledger.retention(), Duration::from_secs(604800));
        assert_eq!(config.dead_letter.backend, DeadLetterBackend::Memory);
        assert_eq!(config.routing.queues.len(), 4);
        assert_eq!(config.routing.queues["completed"], "completed-queue");
    }

    #[test]
    fn test_retry_settings_convert() {
        let config = AppConfig::from_toml(TEST_CONFIG).unwrap();
        let retry = RetryConfig::from(&config.consumer_retry);

        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let raw = TEST_CONFIG.replace("batch_size = 10", "batch_size = 0");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_lease_must_be_shorter_than_retention() {
        let raw = TEST_CONFIG.replace("lease_ms = 30000", "lease_ms = 604800000");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("lease_ms"));

        let raw = TEST_CONFIG.replace("lease_ms = 30000", "lease_ms = 0");
        assert!(matches!(AppConfig::from_toml(&raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_scylla_backend_requires_nodes() {
        let raw = TEST_CONFIG.replace("backend = \"memory\"\nknown_nodes", "backend = \"scylla\"\nknown_nodes");
        let err = AppConfig::from_toml(&raw).unwrap_err();
        assert!(err.to_string().contains("known_nodes"));
    }

    #[test]
    fn test_unknown_backend_fails_to_load() {
        let raw = TEST_CONFIG.replace("backend = \"memory\"\nredis_url", "backend = \"etcd\"\nredis_url");
        assert!(matches!(AppConfig::from_toml(&raw), Err(ConfigError::Load(_))));
    }
}
