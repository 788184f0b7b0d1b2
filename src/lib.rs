//! Action item ingestion pipeline
//!
//! Consumes action item events from Kafka topics, converts them to commands
//! and persists them. Every delivered record has its offset committed exactly
//! once, whatever the outcome; failures are captured as diagnostic records
//! instead of being redelivered. A health controller pauses all consumers
//! while the persistence layer is down.
//!
//! # Example
//!
//! ```no_run
//! use action_ingest::{Collaborators, IngestApp, IngestConfig};
//! use action_ingest::consumer::MemoryBroker;
//! use action_ingest::store::{MemoryActionItemRepository, MemoryErrorStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = MemoryBroker::new();
//! let repository = MemoryActionItemRepository::new();
//! let errors = MemoryErrorStore::new();
//!
//! let config = IngestConfig::builder()
//!     .topics(["action-items"])
//!     .group_id_prefix("ingest")
//!     .build();
//!
//! let app = IngestApp::start(config, Collaborators::in_memory(&broker, &repository, &errors)).await?;
//! broker.produce("action-items", 0, None, br#"{"title":"t","typeCode":"T","status":"OPEN"}"#);
//!
//! app.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub use app::{Collaborators, IngestApp};
pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use model::{ActionItem, ActionItemCommand, ProcessingError};

/// Pipeline wiring
pub mod app;

/// Process configuration
pub mod config;

/// Topic consumers, dispatch and offset handling
pub mod consumer;

/// Correlation context propagation
pub mod context;

/// Error types
pub mod error;

/// Health-driven backpressure
pub mod health;

/// Commands, stored items and captured errors
pub mod model;

/// Record processing and completion handling
pub mod pipeline;

/// Diagnostic HTTP interface
#[cfg(feature = "service")]
pub mod service;

/// Persistence collaborators
pub mod store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    init_tracing_with("info", true);
}

/// Initialize tracing with a fallback level and output format.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing_with(default_level: &str, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
}
