//! Completion handling: capture on failure, then always commit

use crate::consumer::metrics::IngestMetrics;
use crate::consumer::record::InboundRecord;
use crate::consumer::retry::RetryExecutor;
use crate::context;
use crate::model::ProcessingError;
use crate::pipeline::capture::ErrorCapture;
use crate::pipeline::dead_letter::{DeadLetter, DeadLetterSink};
use crate::pipeline::ProcessingOutcome;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// How a unit of work ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed { error_type: String },
}

/// What happened to one dispatched record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub outcome: OutcomeStatus,
    /// Whether the offset commit went through
    pub committed: bool,
    /// The error record built for a failed outcome
    pub captured: Option<ProcessingError>,
}

/// Observes each outcome exactly once and commits the record's offset
#[derive(Clone)]
pub struct ResultHandler {
    capture: ErrorCapture,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    retry: RetryExecutor,
    metrics: IngestMetrics,
}

impl ResultHandler {
    pub fn new(capture: ErrorCapture, retry: RetryExecutor, metrics: IngestMetrics) -> Self {
        Self {
            capture,
            dead_letter: None,
            retry,
            metrics,
        }
    }

    /// Also forward failed payloads to `sink`
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Capture a failure if there is one, then commit `record`'s offset.
    ///
    /// The commit happens for every outcome. Failed records are not
    /// redelivered.
    pub async fn on_complete(&self, record: InboundRecord, outcome: ProcessingOutcome) -> DispatchReport {
        let topic = record.topic.clone();
        let partition = record.partition;
        let offset = record.offset;

        let (status, captured) = match outcome {
            ProcessingOutcome::Success(item) => {
                self.metrics.increment_succeeded();
                debug!(item_id = %item.id, "Record processed");
                (OutcomeStatus::Succeeded, None)
            }
            ProcessingOutcome::Failure(failure) => {
                let kind = failure.kind();
                self.metrics.increment_failed(kind);
                warn!(error_type = kind, "Record processing failed: {}", failure);

                let source = format!("{}-consumer", topic);
                let captured = self.capture.capture(&source, &failure, record.payload()).await;

                if let Some(sink) = &self.dead_letter {
                    let letter = DeadLetter::new(&record, &failure, context::current_correlation_id());
                    match sink.send(letter).await {
                        Ok(()) => self.metrics.increment_dead_lettered(),
                        Err(e) => error!("Failed to forward record to dead-letter sink: {}", e),
                    }
                }

                (
                    OutcomeStatus::Failed {
                        error_type: kind.to_string(),
                    },
                    Some(captured),
                )
            }
        };

        let committed = match record.acknowledge(&self.retry).await {
            Ok(()) => {
                self.metrics.increment_committed();
                true
            }
            Err(_) => {
                self.metrics.increment_commit_failures();
                false
            }
        };

        DispatchReport {
            topic,
            partition,
            offset,
            outcome: status,
            committed,
            captured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::memory::MemoryBroker;
    use crate::consumer::retry::RetryPolicy;
    use crate::error::IngestError;
    use crate::model::{ActionItem, ActionItemCommand};
    use crate::pipeline::dead_letter::MemoryDeadLetterSink;
    use crate::store::MemoryErrorStore;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn handler(store: &MemoryErrorStore, metrics: &IngestMetrics) -> ResultHandler {
        ResultHandler::new(
            ErrorCapture::new(Arc::new(store.clone()), metrics.clone()),
            RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1))),
            metrics.clone(),
        )
    }

    fn item() -> ActionItem {
        let command =
            ActionItemCommand::from_payload(br#"{"title":"t","typeCode":"T","status":"OPEN"}"#).unwrap();
        ActionItem::from_command(Uuid::new_v4(), command, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_success_commits_without_capture() {
        let broker = MemoryBroker::new();
        let store = MemoryErrorStore::new();
        let metrics = IngestMetrics::new();

        let record = broker.record("items", 0, 7, None, Some(&b"{}"[..]));
        let report = handler(&store, &metrics)
            .on_complete(record, ProcessingOutcome::Success(item()))
            .await;

        assert_eq!(report.outcome, OutcomeStatus::Succeeded);
        assert!(report.committed);
        assert!(report.captured.is_none());
        assert_eq!(broker.commit_count("items", 0, 7), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failure_captures_then_commits() {
        let broker = MemoryBroker::new();
        let store = MemoryErrorStore::new();
        let metrics = IngestMetrics::new();
        let sink = MemoryDeadLetterSink::new();

        let record = broker.record("items", 1, 3, None, Some(&b"garbage"[..]));
        let report = handler(&store, &metrics)
            .with_dead_letter(Arc::new(sink.clone()))
            .on_complete(
                record,
                ProcessingOutcome::Failure(IngestError::Deserialization("bad".into())),
            )
            .await;

        assert_eq!(
            report.outcome,
            OutcomeStatus::Failed {
                error_type: "DeserializationError".into()
            }
        );
        assert!(report.committed);
        assert_eq!(broker.commit_count("items", 1, 3), 1);

        let errors = store.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "items-consumer");
        assert_eq!(errors[0].payload.as_deref(), Some(&b"garbage"[..]));
        assert_eq!(sink.letters().len(), 1);
        assert_eq!(metrics.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_capture_failure_still_commits() {
        let broker = MemoryBroker::new();
        let store = MemoryErrorStore::new();
        store.set_failing(true);
        let metrics = IngestMetrics::new();

        let record = broker.record("items", 0, 1, None, Some(&b"{}"[..]));
        let report = handler(&store, &metrics)
            .on_complete(record, ProcessingOutcome::Failure(IngestError::Persistence("down".into())))
            .await;

        assert!(report.committed);
        assert!(report.captured.is_some());
        assert_eq!(broker.commit_count("items", 0, 1), 1);
    }

    #[tokio::test]
    async fn test_exhausted_commit_is_reported() {
        let broker = MemoryBroker::new();
        broker.fail_commits(10);
        let store = MemoryErrorStore::new();
        let metrics = IngestMetrics::new();

        let record = broker.record("items", 0, 2, None, Some(&b"{}"[..]));
        let report = handler(&store, &metrics)
            .on_complete(record, ProcessingOutcome::Success(item()))
            .await;

        assert!(!report.committed);
        assert_eq!(metrics.snapshot().commit_failures, 1);
    }
}
