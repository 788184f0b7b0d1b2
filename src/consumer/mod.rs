//! Topic consumers and the dispatch path into the worker pool
//!
//! This module provides:
//! - One sequential poll loop per configured topic
//! - Bounded worker pool with blocking submission
//! - Per-record offset acknowledgment with fixed-backoff retry
//! - Pause/resume control used by the health controller
//! - Graceful shutdown of loops and in-flight work
//!
//! # Example
//!
//! ```no_run
//! use action_ingest::consumer::{MemoryBroker, TopicRegistration};
//! use action_ingest::consumer::source::RecordSourceFactory;
//! use std::time::Duration;
//!
//! # async fn example() -> action_ingest::IngestResult<()> {
//! let broker = MemoryBroker::new();
//! broker.produce("action-items", 0, None, br#"{"title":"t","typeCode":"T","status":"OPEN"}"#);
//!
//! let source = broker.create(&TopicRegistration::new("action-items", "ingest", true))?;
//! let records = source.poll(10, Duration::from_millis(100)).await?;
//! assert_eq!(records.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod dispatcher;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod record;
pub mod registrar;
pub mod retry;
pub mod shutdown;
pub mod source;

pub use consumer::{ConsumerHandle, ConsumerStatus, TopicConsumer};
pub use dispatcher::{DispatchHandle, Dispatcher};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaCommitter, KafkaDeadLetterProducer, KafkaSourceFactory};
pub use memory::{CommittedOffset, MemoryBroker};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use pool::{PoolStats, WorkerPool};
pub use record::{Acknowledgment, CommitFailureSignal, InboundRecord, OffsetCommitter};
pub use registrar::{ConsumerRegistry, TopicRegistrar, TopicRegistration};
pub use retry::{RetryExecutor, RetryPolicy, RetryResult};
pub use shutdown::ShutdownState;
pub use source::{RecordSource, RecordSourceFactory};
