//! Ingestion error types

use std::io;
use thiserror::Error;

/// Result type for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Ingestion error types
#[derive(Error, Debug)]
pub enum IngestError {
    /// Record payload could not be converted to a command
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Record payload is not valid JSON for an action item
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Command failed business validation
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Storage write or read failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Broker connectivity errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Offset commit failed
    #[error("Failed to commit offset {offset} for {topic}/{partition}: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// A topic could not be wired at startup
    #[error("Failed to register consumer for topic '{topic}'")]
    Registration {
        topic: String,
        #[source]
        source: Box<IngestError>,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Processing panicked inside a worker
    #[error("Processing panicked: {0}")]
    Panicked(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Shutdown errors
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IngestError {
    /// Stable name of the error kind, recorded on captured processing errors
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Deserialization(_) | IngestError::Json(_) => "DeserializationError",
            IngestError::Validation(_) => "ValidationError",
            IngestError::Persistence(_) => "PersistenceError",
            IngestError::Broker(_) => "BrokerError",
            #[cfg(feature = "kafka")]
            IngestError::Kafka(_) => "BrokerError",
            IngestError::Commit { .. } => "CommitError",
            IngestError::Registration { .. } => "RegistrationError",
            IngestError::Config(_) => "ConfigError",
            IngestError::Panicked(_) => "PanicError",
            IngestError::Timeout(_) => "TimeoutError",
            IngestError::Channel(_) => "ChannelError",
            IngestError::Shutdown(_) => "ShutdownError",
            IngestError::Io(_) => "IoError",
        }
    }

    /// Check if error is retryable at the consumer-loop level.
    ///
    /// Per-record failures are never retried; they are captured and committed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Broker(_) => true,
            #[cfg(feature = "kafka")]
            IngestError::Kafka(_) => true,
            IngestError::Commit { .. } => true,
            IngestError::Timeout(_) => true,
            IngestError::Io(_) => true,
            _ => false,
        }
    }

    /// Wrap a startup failure for the given topic
    pub fn registration(topic: impl Into<String>, source: IngestError) -> Self {
        IngestError::Registration {
            topic: topic.into(),
            source: Box::new(source),
        }
    }
}

/// Convert from channel receive errors
impl From<tokio::sync::oneshot::error::RecvError> for IngestError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        IngestError::Channel(format!("Failed to receive: {}", err))
    }
}

/// Convert from toml parse errors
impl From<toml::de::Error> for IngestError {
    fn from(err: toml::de::Error) -> Self {
        IngestError::Config(err.to_string())
    }
}
