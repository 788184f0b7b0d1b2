//! Optional forwarding of failed payloads to a dead-letter destination
//!
//! Failed records are still committed. The dead-letter copy only keeps the
//! original payload somewhere it can be replayed from by hand.

use crate::consumer::record::InboundRecord;
use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// A failed record plus the metadata needed to trace it back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub error_type: String,
    pub error_message: String,
    pub correlation_id: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(record: &InboundRecord, error: &IngestError, correlation_id: Option<String>) -> Self {
        Self {
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            key: record.key.clone(),
            payload: record.value.clone(),
            error_type: error.kind().to_string(),
            error_message: error.to_string(),
            correlation_id,
            failed_at: Utc::now(),
        }
    }

    /// Header pairs attached when the letter is produced to a broker
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("dlq.original.topic", self.original_topic.clone()),
            ("dlq.original.partition", self.original_partition.to_string()),
            ("dlq.original.offset", self.original_offset.to_string()),
            ("dlq.error.type", self.error_type.clone()),
            ("dlq.error.message", self.error_message.clone()),
            ("dlq.timestamp", self.failed_at.timestamp().to_string()),
        ];
        if let Some(id) = &self.correlation_id {
            headers.push(("dlq.correlation.id", id.clone()));
        }
        headers
    }
}

/// Destination for dead letters
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn send(&self, letter: DeadLetter) -> IngestResult<()>;
}

/// Sink collecting letters in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> IngestResult<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::memory::MemoryBroker;

    #[test]
    fn test_headers_carry_origin() {
        let broker = MemoryBroker::new();
        let record = broker.record("orders", 3, 42, None, Some(&b"oops"[..]));
        let letter = DeadLetter::new(
            &record,
            &IngestError::Deserialization("bad".into()),
            Some("corr-1".into()),
        );

        let headers = letter.headers();
        assert!(headers.contains(&("dlq.original.topic", "orders".to_string())));
        assert!(headers.contains(&("dlq.original.offset", "42".to_string())));
        assert!(headers.contains(&("dlq.error.type", "DeserializationError".to_string())));
        assert!(headers.contains(&("dlq.correlation.id", "corr-1".to_string())));
        assert_eq!(letter.payload.as_deref(), Some(&b"oops"[..]));
    }
}
