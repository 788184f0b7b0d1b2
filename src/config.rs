//! Ingestion configuration structures

use crate::consumer::retry::RetryPolicy;
use crate::error::{IngestError, IngestResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Kafka properties that may be passed through to the client
pub const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Fetch settings
    "fetch.min.bytes",
    "fetch.wait.max.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    "receive.buffer.bytes",
    "send.buffer.bytes",
    // Consumer settings
    "queued.min.messages",
    "queued.max.messages.kbytes",
    "fetch.error.backoff.ms",
    "fetch.message.max.bytes",
    // Connection settings
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    // Security
    "security.protocol",
    "sasl.mechanisms",
    "sasl.username",
    "sasl.password",
    // Monitoring
    "statistics.interval.ms",
];

/// Sizing of the shared worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers kept alive for the lifetime of the pool
    pub core_size: usize,
    /// Upper bound on concurrently running units of work
    pub max_size: usize,
    /// Submissions that may wait for a worker before the submitter blocks
    pub queue_capacity: usize,
    /// Idle time after which an overflow worker exits
    pub keep_alive: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            core_size: cpus,
            max_size: cpus * 2,
            queue_capacity: 500,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Health probe and backpressure settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failed probes before all consumers are paused
    pub failure_threshold: u32,
    /// Time between scheduled probes
    pub probe_interval: Duration,
    /// Upper bound on a single probe
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide ingestion configuration, read once at start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Schema registry endpoint, handed to the broker client when present
    pub schema_registry_url: Option<String>,

    /// Topics to consume from, one consumer each
    pub topics: Vec<String>,

    /// Prefix for the per-topic consumer group id
    pub group_id_prefix: String,

    /// Start consumer loops as soon as they are registered
    pub auto_start: bool,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Offset reset policy (earliest, latest, none)
    pub auto_offset_reset: String,

    /// Maximum records fetched per poll
    pub poll_batch_size: usize,

    /// Time a single poll waits for records
    pub poll_timeout: Duration,

    /// Worker pool sizing
    pub worker_pool: WorkerPoolConfig,

    /// Health-driven backpressure
    pub health: HealthConfig,

    /// Fixed backoff applied to commits and polls
    pub retry_policy: RetryPolicy,

    /// Optional topic receiving failed payloads
    pub dead_letter_topic: Option<String>,

    /// Diagnostic HTTP bind address
    pub http_addr: String,

    /// Time allowed for in-flight work during shutdown
    pub shutdown_timeout: Duration,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            schema_registry_url: None,
            topics: vec!["action-items".to_string()],
            group_id_prefix: "action-ingest".to_string(),
            auto_start: true,
            session_timeout_ms: 30000,
            auto_offset_reset: "earliest".to_string(),
            poll_batch_size: 100,
            poll_timeout: Duration::from_millis(500),
            worker_pool: WorkerPoolConfig::default(),
            health: HealthConfig::default(),
            retry_policy: RetryPolicy::default(),
            dead_letter_topic: None,
            http_addr: "0.0.0.0:8080".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            kafka_properties: HashMap::new(),
        }
    }
}

/// Builder for IngestConfig
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self {
            config: IngestConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.brokers = brokers.into();
        self
    }

    pub fn schema_registry_url(mut self, url: impl Into<String>) -> Self {
        self.config.schema_registry_url = Some(url.into());
        self
    }

    /// Set the topics to consume
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Set the consumer group prefix
    pub fn group_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.group_id_prefix = prefix.into();
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.config.auto_start = auto_start;
        self
    }

    /// Set poll batch size and wait time
    pub fn poll(mut self, batch_size: usize, timeout: Duration) -> Self {
        self.config.poll_batch_size = batch_size;
        self.config.poll_timeout = timeout;
        self
    }

    /// Set worker pool sizing
    pub fn worker_pool(mut self, core_size: usize, max_size: usize, queue_capacity: usize) -> Self {
        self.config.worker_pool.core_size = core_size;
        self.config.worker_pool.max_size = max_size;
        self.config.worker_pool.queue_capacity = queue_capacity;
        self
    }

    /// Set the health failure threshold and probe interval
    pub fn health(mut self, failure_threshold: u32, probe_interval: Duration) -> Self {
        self.config.health.failure_threshold = failure_threshold;
        self.config.health.probe_interval = probe_interval;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Set the dead letter topic
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.dead_letter_topic = Some(topic.into());
        self
    }

    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.http_addr = addr.into();
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.kafka_properties.insert(key.into(), value.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> IngestConfig {
        self.config
    }
}

impl Default for IngestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestConfig {
    /// Create a new config builder
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::new()
    }

    /// Parse a TOML document
    pub fn from_toml_str(raw: &str) -> IngestResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> IngestResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id_prefix.is_empty() {
            return Err("Group ID prefix cannot be empty".to_string());
        }

        if self.topics.is_empty() {
            return Err("Topics cannot be empty".to_string());
        }

        if self.poll_batch_size == 0 {
            return Err("Poll batch size must be greater than 0".to_string());
        }

        let pool = &self.worker_pool;
        if pool.core_size == 0 || pool.max_size == 0 {
            return Err("Worker pool sizes must be greater than 0".to_string());
        }

        if pool.core_size > pool.max_size {
            return Err("Worker pool core size cannot exceed max size".to_string());
        }

        if pool.queue_capacity == 0 {
            return Err("Worker pool queue capacity must be greater than 0".to_string());
        }

        if self.health.failure_threshold == 0 {
            return Err("Health failure threshold must be greater than 0".to_string());
        }

        if self.health.probe_interval.is_zero() {
            return Err("Health probe interval must be greater than 0".to_string());
        }

        for key in self.kafka_properties.keys() {
            if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
                return Err(format!("Disallowed Kafka property '{}'", key));
            }
        }

        Ok(())
    }

    /// Validate, mapping failures into the crate error
    pub fn ensure_valid(&self) -> IngestResult<()> {
        self.validate().map_err(IngestError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.failure_threshold, 3);
        assert!(config.auto_start);
    }

    #[test]
    fn test_builder() {
        let config = IngestConfig::builder()
            .brokers("kafka:9092")
            .topics(["a", "b"])
            .group_id_prefix("svc")
            .worker_pool(2, 4, 10)
            .health(5, Duration::from_secs(1))
            .build();

        assert_eq!(config.brokers, "kafka:9092");
        assert_eq!(config.topics, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.worker_pool.max_size, 4);
        assert_eq!(config.health.failure_threshold, 5);
    }

    #[test]
    fn test_validation_failures() {
        let config = IngestConfig::builder().topics(Vec::<String>::new()).build();
        assert!(config.validate().is_err());

        let config = IngestConfig::builder().worker_pool(8, 4, 10).build();
        assert!(config.validate().is_err());

        let config = IngestConfig::builder()
            .kafka_property("bootstrap.servers", "evil:9092")
            .build();
        assert!(config.validate().is_err());

        let config = IngestConfig::builder().health(0, Duration::from_secs(1)).build();
        assert!(matches!(config.ensure_valid(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_partial_toml() {
        let raw = r#"
            brokers = "broker-1:9092,broker-2:9092"
            topics = ["action-items", "action-items-eu"]
            group_id_prefix = "ingest"

            [worker_pool]
            core_size = 2
            max_size = 6

            [health]
            failure_threshold = 4
        "#;

        let config = IngestConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.topics.len(), 2);
        assert_eq!(config.worker_pool.core_size, 2);
        assert_eq!(config.worker_pool.queue_capacity, 500);
        assert_eq!(config.health.failure_threshold, 4);
        assert_eq!(config.health.probe_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(&path, "topics = [\"orders\"]\ndead_letter_topic = \"orders-dlq\"\n").unwrap();

        let config = IngestConfig::from_file(&path).unwrap();
        assert_eq!(config.topics, vec!["orders".to_string()]);
        assert_eq!(config.dead_letter_topic.as_deref(), Some("orders-dlq"));

        let missing = IngestConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(IngestError::Io(_))));
    }
}
