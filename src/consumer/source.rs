//! Broker-facing record sources

use crate::consumer::record::InboundRecord;
use crate::consumer::registrar::TopicRegistration;
use crate::error::IngestResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A single-topic, single-group stream of records
#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    /// Topic this source reads
    fn topic(&self) -> &str;

    /// Fetch up to `max_records`, waiting at most `timeout` for the first one
    async fn poll(&self, max_records: usize, timeout: Duration) -> IngestResult<Vec<InboundRecord>>;

    /// Stop fetching without leaving the group. Idempotent.
    async fn pause(&self) -> IngestResult<()>;

    /// Undo [`RecordSource::pause`]. Idempotent.
    async fn resume(&self) -> IngestResult<()>;

    /// Called repeatedly while paused so the session stays alive
    async fn idle(&self, timeout: Duration) -> IngestResult<()> {
        tokio::time::sleep(timeout).await;
        Ok(())
    }

    /// Release broker resources when the loop exits
    async fn close(&self) {}
}

/// Creates one source per registered topic
pub trait RecordSourceFactory: Send + Sync {
    fn create(&self, registration: &TopicRegistration) -> IngestResult<Arc<dyn RecordSource>>;
}
