//! Inbound records and their offset acknowledgment

use crate::consumer::retry::{RetryExecutor, RetryResult};
use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Commits a single record's offset to the broker
#[async_trait]
pub trait OffsetCommitter: Send + Sync + 'static {
    /// Mark `offset` on `topic`/`partition` as processed
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> IngestResult<()>;
}

/// Raised by acknowledgments whose commit exhausted its retries; read by the
/// owning consumer loop before its next poll.
#[derive(Debug, Default)]
pub struct CommitFailureSignal {
    pending: AtomicU64,
}

impl CommitFailureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of failures since the last call
    pub fn take(&self) -> u64 {
        self.pending.swap(0, Ordering::SeqCst)
    }
}

/// Capability to commit exactly one record's offset.
///
/// Consumed by [`Acknowledgment::acknowledge`], so a record cannot be
/// committed twice.
pub struct Acknowledgment {
    committer: Arc<dyn OffsetCommitter>,
    topic: String,
    partition: i32,
    offset: i64,
    failure_signal: Option<Arc<CommitFailureSignal>>,
}

impl Acknowledgment {
    pub fn new(committer: Arc<dyn OffsetCommitter>, topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            committer,
            topic: topic.to_string(),
            partition,
            offset,
            failure_signal: None,
        }
    }

    /// Commit the bound offset, retrying broker failures with `retry`
    pub async fn acknowledge(self, retry: &RetryExecutor) -> IngestResult<()> {
        let Self {
            committer,
            topic,
            partition,
            offset,
            failure_signal,
        } = self;

        let result = retry
            .execute_with_predicate(
                || committer.commit(&topic, partition, offset),
                IngestError::is_retryable,
            )
            .await;

        match result {
            RetryResult::Success { attempts, .. } => {
                debug!(topic = %topic, partition, offset, attempts, "Offset committed");
                Ok(())
            }
            RetryResult::Failed { error, attempts } => {
                error!(
                    topic = %topic,
                    partition,
                    offset,
                    attempts = attempts + 1,
                    "Giving up on offset commit: {}",
                    error
                );
                if let Some(signal) = failure_signal {
                    signal.raise();
                }
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledgment")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}

/// A record delivered by a consumer loop
#[derive(Debug)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub received_at: DateTime<Utc>,
    ack: Acknowledgment,
}

impl InboundRecord {
    /// Create a record bound to `committer`
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        let topic = topic.into();
        let ack = Acknowledgment::new(committer, &topic, partition, offset);
        Self {
            topic,
            partition,
            offset,
            key,
            value,
            received_at: Utc::now(),
            ack,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Route exhausted commit failures to the owning consumer loop
    pub fn with_commit_signal(mut self, signal: Arc<CommitFailureSignal>) -> Self {
        self.ack.failure_signal = Some(signal);
        self
    }

    /// Consume the record and commit its offset
    pub async fn acknowledge(self, retry: &RetryExecutor) -> IngestResult<()> {
        self.ack.acknowledge(retry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::memory::MemoryBroker;
    use crate::consumer::retry::RetryPolicy;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acknowledge_commits_once() {
        let broker = MemoryBroker::new();
        let record = broker.record("orders", 0, 5, None, Some(&b"{}"[..]));
        let retry = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1)));

        record.acknowledge(&retry).await.unwrap();
        assert_eq!(broker.commit_count("orders", 0, 5), 1);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried() {
        let broker = MemoryBroker::new();
        broker.fail_commits(1);
        let record = broker.record("orders", 0, 9, None, None);
        let retry = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1)));

        record.acknowledge(&retry).await.unwrap();
        assert_eq!(broker.commit_count("orders", 0, 9), 1);
    }

    #[tokio::test]
    async fn test_exhausted_commit_raises_signal() {
        let broker = MemoryBroker::new();
        broker.fail_commits(10);
        let signal = Arc::new(CommitFailureSignal::new());
        let record = broker
            .record("orders", 1, 3, None, None)
            .with_commit_signal(signal.clone());
        let retry = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1)));

        let err = record.acknowledge(&retry).await.unwrap_err();
        assert_eq!(err.kind(), "CommitError");
        assert_eq!(broker.commit_count("orders", 1, 3), 0);
        assert_eq!(signal.take(), 1);
        assert_eq!(signal.take(), 0);
    }
}
