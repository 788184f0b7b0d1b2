//! Correlation context carried from the consumer loop into worker tasks
//!
//! The consumer loop owns a [`BatchContext`] for the batch it is dispatching.
//! For every record it captures a [`ContextSnapshot`] by value and hands it to
//! the dispatcher. Inside the worker the snapshot is restored into a
//! [`CorrelationContext`] and scoped to that single unit of work, so
//! [`current`] sees it only while the record is being processed.

use crate::consumer::record::InboundRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: CorrelationContext;
}

/// Batch-level context, set on the consumer loop at the start of each poll batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    correlation_id: String,
    group_id: String,
    consumer_name: String,
}

impl BatchContext {
    /// Start a new batch with a fresh correlation id
    pub fn new(group_id: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            group_id: group_id.into(),
            consumer_name: consumer_name.into(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Capture the batch fields for handoff to a worker
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            batch: self.clone(),
        }
    }
}

/// Context captured on the consumer loop, restored on the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    batch: BatchContext,
}

impl ContextSnapshot {
    pub fn correlation_id(&self) -> &str {
        &self.batch.correlation_id
    }

    /// Restore on the worker, enriched with the record's own metadata
    pub fn restore(self, record: &InboundRecord) -> CorrelationContext {
        CorrelationContext {
            correlation_id: self.batch.correlation_id,
            group_id: self.batch.group_id,
            consumer_name: self.batch.consumer_name,
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.as_deref().map(|k| String::from_utf8_lossy(k).into_owned()),
            received_at: record.received_at,
            worker_thread: std::thread::current().name().map(str::to_string),
        }
    }
}

/// Context visible to code running on behalf of one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub group_id: String,
    pub consumer_name: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub received_at: DateTime<Utc>,
    pub worker_thread: Option<String>,
}

impl CorrelationContext {
    /// Tracing span carrying the correlation fields
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "record",
            correlation_id = %self.correlation_id,
            group_id = %self.group_id,
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            key = self.key.as_deref().unwrap_or(""),
        )
    }

    /// Run `fut` with this context installed; it is gone once `fut` completes
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }
}

/// Context of the record being processed by the calling task, if any
pub fn current() -> Option<CorrelationContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Correlation id of the record being processed by the calling task, if any
pub fn current_correlation_id() -> Option<String> {
    CURRENT.try_with(|ctx| ctx.correlation_id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::memory::MemoryBroker;

    #[tokio::test]
    async fn test_context_only_inside_scope() {
        let broker = MemoryBroker::new();
        let record = broker.record("orders", 2, 17, Some(&b"k-1"[..]), Some(&b"{}"[..]));

        let batch = BatchContext::new("ingest-orders", "orders-consumer-0");
        let snapshot = batch.snapshot();
        assert_eq!(snapshot.correlation_id(), batch.correlation_id());

        assert!(current().is_none());

        let ctx = snapshot.restore(&record);
        let seen = ctx
            .clone()
            .scope(async { current().expect("context inside scope") })
            .await;

        assert_eq!(seen.correlation_id, batch.correlation_id());
        assert_eq!(seen.partition, 2);
        assert_eq!(seen.offset, 17);
        assert_eq!(seen.key.as_deref(), Some("k-1"));
        assert!(current().is_none());
        assert!(current_correlation_id().is_none());
    }

    #[test]
    fn test_batches_get_distinct_ids() {
        let a = BatchContext::new("g", "c");
        let b = BatchContext::new("g", "c");
        assert_ne!(a.correlation_id(), b.correlation_id());
    }
}
