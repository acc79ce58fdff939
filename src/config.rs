//! Configuration types for anvilq.
//!
//! Every setting that the delivery guarantees depend on (durability, prefetch,
//! retry ceiling, task timeout, dead-letter queue, confirm mode) must be spelled
//! out when a configuration is deserialized: those fields carry no serde
//! defaults, so a missing key is an error instead of a silently weaker setup.

use crate::error::{AnvilError, AnvilResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for anvilq.
///
/// # Examples
///
/// ```rust
/// use anvilq::config::{AnvilConfig, QueueConfig, WorkerConfig};
///
/// let config = AnvilConfig {
///     workers: WorkerConfig::with_workers(4).with_prefetch(1),
///     queue: QueueConfig::named("emails").with_dead_letter("emails.dead"),
///     ..AnvilConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnvilConfig {
    /// Broker connection settings
    pub broker: BrokerConfig,

    /// Durable queue topology
    pub queue: QueueConfig,

    /// Worker pool settings
    pub workers: WorkerConfig,

    /// Retry policy for failed deliveries
    pub retry: RetryPolicy,

    /// Producer settings
    pub publisher: PublisherConfig,

    /// Engine-level configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AnvilConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            publisher: PublisherConfig::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL (e.g., "amqp://localhost:5672")
    pub url: String,

    /// Name reported to the broker for this connection
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Timeout for establishing a connection (in seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Reconnect backoff after connection loss
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_connection_name() -> String {
    "anvilq".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connection_name: default_connection_name(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt (in milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound for the delay between attempts (in milliseconds)
    pub max_delay_ms: u64,

    /// Randomize delays so reconnecting processes spread out
    pub enable_jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000, // 1 second
            max_delay_ms: 30000, // 30 seconds
            enable_jitter: true,
        }
    }
}

/// Durable queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Main work queue name
    pub name: String,

    /// Must be true; rejected by validation otherwise
    pub durable: bool,

    /// Queue receiving permanently failed envelopes (`null` disables it)
    #[serde(deserialize_with = "Option::deserialize")]
    pub dead_letter_queue: Option<String>,

    /// Maximum number of ready messages; publishes beyond it are rejected
    #[serde(default)]
    pub max_length: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::named("task_queue")
    }
}

impl QueueConfig {
    /// Durable queue `name` with a `<name>.dead` dead-letter queue.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            dead_letter_queue: Some(format!("{}.dead", name)),
            name,
            durable: true,
            max_length: None,
        }
    }

    /// Set the dead-letter queue.
    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    /// Drop permanently failed envelopes instead of dead-lettering them.
    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter_queue = None;
        self
    }

    /// Cap the queue length.
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Side queue holding envelopes that wait out a retry delay.
    pub fn delay_queue_name(&self) -> String {
        format!("{}.retry", self.name)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker slots (one subscription each)
    pub num_workers: usize,

    /// Maximum unacknowledged deliveries per slot
    pub prefetch_count: u16,

    /// Maximum time a task can run before it counts as a transient failure (in seconds)
    pub task_timeout_secs: u64,

    /// Time to wait for in-flight deliveries during shutdown (in seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum number of consecutive restarts for a single slot before circuit breaking
    #[serde(default = "default_max_restart_count")]
    pub max_restart_count: u32,

    /// Time to wait between slot restarts (in milliseconds)
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_restart_count() -> u32 {
    100
}

fn default_restart_delay() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            prefetch_count: 1,
            task_timeout_secs: 300, // 5 minutes
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_restart_count: default_max_restart_count(),
            restart_delay_ms: default_restart_delay(),
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific number of slots.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the per-slot prefetch limit.
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Set the task timeout.
    pub fn with_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = timeout_secs;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Task timeout as a duration.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// How `submit` decides a publish succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmMode {
    /// Wait for the broker to confirm it took ownership of the message
    BrokerConfirm,
    /// Success once the bytes are handed to the transport (weaker)
    TransportOnly,
}

/// Producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Publisher confirmation mode
    pub confirm_mode: ConfirmMode,

    /// Upper bound for a publish (including its confirm) (in seconds)
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

fn default_publish_timeout() -> u64 {
    10
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm_mode: ConfirmMode::BrokerConfirm,
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl PublisherConfig {
    /// Publish timeout as a duration.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Health check interval (in seconds)
    pub health_check_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by `RUST_LOG`)
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl AnvilConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 2,
                task_timeout_secs: 60,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(3, 1000),
            engine: EngineConfig {
                health_check_interval_secs: 10,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: num_cpus::get().max(1),
                prefetch_count: 4,
                task_timeout_secs: 300,
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            retry: RetryPolicy::exponential(5),
            engine: EngineConfig {
                health_check_interval_secs: 60,
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            broker: BrokerConfig {
                reconnect: ReconnectPolicy {
                    base_delay_ms: 10,
                    max_delay_ms: 100,
                    enable_jitter: false,
                },
                ..Default::default()
            },
            workers: WorkerConfig {
                num_workers: 1,
                prefetch_count: 1,
                task_timeout_secs: 10,
                shutdown_timeout_secs: 5,
                max_restart_count: 3,
                restart_delay_ms: 10,
            },
            retry: RetryPolicy::immediate(3),
            publisher: PublisherConfig {
                confirm_mode: ConfirmMode::BrokerConfirm,
                publish_timeout_secs: 5,
            },
            engine: EngineConfig {
                health_check_interval_secs: 1,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a JSON configuration and validate it.
    pub fn from_json_str(json: &str) -> AnvilResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AnvilError::config(format!("invalid configuration: {}", e)))?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Read a JSON configuration file and validate it.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> AnvilResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AnvilError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Defaults, or the file named by `ANVILQ_CONFIG`, with `ANVILQ_*`
    /// overrides applied on top.
    pub fn load() -> AnvilResult<Self> {
        let config = match std::env::var("ANVILQ_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        let config = config.with_env_overrides()?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Overlay `ANVILQ_*` environment variables on top of this configuration.
    ///
    /// Reads `ANVILQ_URL`, `ANVILQ_QUEUE`, `ANVILQ_DEAD_LETTER_QUEUE` (empty
    /// string disables it), `ANVILQ_PREFETCH`, `ANVILQ_WORKERS`,
    /// `ANVILQ_MAX_RETRIES` and `ANVILQ_TASK_TIMEOUT_SECS`.
    pub fn with_env_overrides(self) -> AnvilResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> AnvilResult<Self> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> AnvilResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| AnvilError::config(format!("{} has invalid value '{}'", key, value)))
        }

        if let Some(url) = lookup("ANVILQ_URL") {
            self.broker.url = url;
        }
        if let Some(name) = lookup("ANVILQ_QUEUE") {
            self.queue.name = name;
        }
        if let Some(dlq) = lookup("ANVILQ_DEAD_LETTER_QUEUE") {
            self.queue.dead_letter_queue = if dlq.is_empty() { None } else { Some(dlq) };
        }
        if let Some(value) = lookup("ANVILQ_PREFETCH") {
            self.workers.prefetch_count = parse("ANVILQ_PREFETCH", value)?;
        }
        if let Some(value) = lookup("ANVILQ_WORKERS") {
            self.workers.num_workers = parse("ANVILQ_WORKERS", value)?;
        }
        if let Some(value) = lookup("ANVILQ_MAX_RETRIES") {
            self.retry.max_retries = parse("ANVILQ_MAX_RETRIES", value)?;
        }
        if let Some(value) = lookup("ANVILQ_TASK_TIMEOUT_SECS") {
            self.workers.task_timeout_secs = parse("ANVILQ_TASK_TIMEOUT_SECS", value)?;
        }

        Ok(self)
    }

    /// Validate and fold all problems into a single configuration error.
    pub fn ensure_valid(&self) -> AnvilResult<()> {
        self.validate()
            .map_err(|errors| AnvilError::config(errors.join("; ")))
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker.url.trim().is_empty() {
            errors.push("Broker URL must not be empty".to_string());
        }

        if self.broker.reconnect.base_delay_ms == 0 {
            errors.push("Reconnect base delay must be greater than 0".to_string());
        }

        if self.broker.reconnect.max_delay_ms < self.broker.reconnect.base_delay_ms {
            errors.push("Reconnect max delay must be greater than or equal to base delay".to_string());
        }

        if self.queue.name.trim().is_empty() {
            errors.push("Queue name must not be empty".to_string());
        }

        if !self.queue.durable {
            errors.push("Queue must be durable".to_string());
        }

        if let Some(dlq) = &self.queue.dead_letter_queue {
            if dlq == &self.queue.name || dlq == &self.queue.delay_queue_name() {
                errors.push("Dead-letter queue must differ from the work and delay queues".to_string());
            }
        }

        if self.queue.max_length == Some(0) {
            errors.push("Queue max length must be greater than 0 when set".to_string());
        }

        if self.workers.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers.num_workers > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        if self.workers.prefetch_count == 0 {
            errors.push("Prefetch count must be greater than 0".to_string());
        }

        if self.workers.task_timeout_secs == 0 {
            errors.push("Task timeout must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if self.publisher.publish_timeout_secs == 0 {
            errors.push("Publish timeout must be greater than 0".to_string());
        }

        if self.engine.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn full_json() -> serde_json::Value {
        json!({
            "broker": { "url": "amqp://localhost:5672" },
            "queue": { "name": "task_queue", "durable": true, "dead_letter_queue": "task_queue.dead" },
            "workers": { "num_workers": 2, "prefetch_count": 1, "task_timeout_secs": 30 },
            "retry": {
                "max_retries": 3,
                "base_delay_ms": 1000,
                "max_delay_ms": 30000,
                "backoff_strategy": { "Exponential": { "multiplier": 2.0 } },
                "enable_jitter": true
            },
            "publisher": { "confirm_mode": "BrokerConfirm" }
        })
    }

    #[test]
    fn test_default_config() {
        let config = AnvilConfig::default();
        assert!(config.workers.num_workers > 0);
        assert!(config.queue.durable);
        assert_eq!(config.queue.name, "task_queue");
        assert_eq!(config.queue.dead_letter_queue.as_deref(), Some("task_queue.dead"));
        assert_eq!(config.publisher.confirm_mode, ConfirmMode::BrokerConfirm);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(AnvilConfig::development().validate().is_ok());
        assert!(AnvilConfig::production().validate().is_ok());

        let testing = AnvilConfig::testing();
        assert_eq!(testing.workers.num_workers, 1);
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_non_durable_queue_rejected() {
        let mut config = AnvilConfig::default();
        config.queue.durable = false;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("durable")));
        assert!(matches!(config.ensure_valid(), Err(AnvilError::ConfigError { .. })));
    }

    #[test]
    fn test_config_validation() {
        let mut config = AnvilConfig::default();

        config.workers.num_workers = 0;
        config.workers.prefetch_count = 0;
        config.queue.dead_letter_queue = Some(config.queue.name.clone());

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("workers")));
        assert!(errors.iter().any(|e| e.contains("Prefetch")));
        assert!(errors.iter().any(|e| e.contains("Dead-letter")));
    }

    #[test]
    fn test_from_json_requires_load_bearing_fields() {
        let config = AnvilConfig::from_json_str(&full_json().to_string()).unwrap();
        assert_eq!(config.workers.prefetch_count, 1);
        assert_eq!(config.workers.shutdown_timeout_secs, 30);
        assert_eq!(config.broker.reconnect.max_delay_ms, 30000);

        for (section, field) in [
            ("queue", "durable"),
            ("queue", "dead_letter_queue"),
            ("workers", "prefetch_count"),
            ("workers", "task_timeout_secs"),
            ("retry", "max_retries"),
            ("publisher", "confirm_mode"),
        ] {
            let mut value = full_json();
            value[section].as_object_mut().unwrap().remove(field);
            let result = AnvilConfig::from_json_str(&value.to_string());
            assert!(result.is_err(), "missing {}.{} should be rejected", section, field);
        }
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("anvilq-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, full_json().to_string()).unwrap();
        let config = AnvilConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.unwrap().workers.prefetch_count, 1);

        let missing = AnvilConfig::from_file(std::env::temp_dir().join("anvilq-missing.json"));
        assert!(matches!(missing, Err(AnvilError::ConfigError { .. })));
    }

    #[test]
    fn test_explicit_null_disables_dead_letter() {
        let mut value = full_json();
        value["queue"]["dead_letter_queue"] = serde_json::Value::Null;

        let config = AnvilConfig::from_json_str(&value.to_string()).unwrap();
        assert!(config.queue.dead_letter_queue.is_none());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ANVILQ_URL", "amqp://rabbit:5672"),
            ("ANVILQ_QUEUE", "emails"),
            ("ANVILQ_DEAD_LETTER_QUEUE", ""),
            ("ANVILQ_PREFETCH", "8"),
            ("ANVILQ_MAX_RETRIES", "7"),
        ]);

        let config = AnvilConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.url, "amqp://rabbit:5672");
        assert_eq!(config.queue.name, "emails");
        assert!(config.queue.dead_letter_queue.is_none());
        assert_eq!(config.workers.prefetch_count, 8);
        assert_eq!(config.retry.max_retries, 7);
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let result = AnvilConfig::default().with_overrides(|key| {
            (key == "ANVILQ_PREFETCH").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(AnvilError::ConfigError { .. })));
    }

    #[test]
    fn test_builders() {
        let queue = QueueConfig::named("emails").with_max_length(100).without_dead_letter();
        assert_eq!(queue.delay_queue_name(), "emails.retry");
        assert_eq!(queue.max_length, Some(100));
        assert!(queue.dead_letter_queue.is_none());

        let workers = WorkerConfig::with_workers(8).with_prefetch(4).with_task_timeout(600);
        assert_eq!(workers.num_workers, 8);
        assert_eq!(workers.prefetch_count, 4);
        assert_eq!(workers.task_timeout(), Duration::from_secs(600));
    }
}
