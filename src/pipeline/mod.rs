//! Record processing: payload to command, command to stored action item
//!
//! [`ProcessingPipeline`] produces a [`ProcessingOutcome`] for every record and
//! never fails itself. The outcome goes to [`ResultHandler`], which captures
//! failures and commits the record's offset.

use crate::consumer::record::InboundRecord;
use crate::error::IngestError;
use crate::model::{ActionItem, ActionItemCommand};
use crate::store::ActionItemRepository;
use std::sync::Arc;
use tracing::debug;

pub mod capture;
pub mod dead_letter;
pub mod result;

pub use capture::ErrorCapture;
pub use dead_letter::{DeadLetter, DeadLetterSink, MemoryDeadLetterSink};
pub use result::{DispatchReport, OutcomeStatus, ResultHandler};

/// Result of processing one record, consumed once by the result handler
#[derive(Debug)]
pub enum ProcessingOutcome {
    Success(ActionItem),
    Failure(IngestError),
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success(_))
    }
}

/// Converts records to commands and persists them
#[derive(Clone)]
pub struct ProcessingPipeline {
    repository: Arc<dyn ActionItemRepository>,
}

impl ProcessingPipeline {
    pub fn new(repository: Arc<dyn ActionItemRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<dyn ActionItemRepository> {
        &self.repository
    }

    pub async fn process(&self, record: &InboundRecord) -> ProcessingOutcome {
        match self.try_process(record).await {
            Ok(item) => ProcessingOutcome::Success(item),
            Err(error) => ProcessingOutcome::Failure(error),
        }
    }

    async fn try_process(&self, record: &InboundRecord) -> Result<ActionItem, IngestError> {
        let payload = record
            .payload()
            .ok_or_else(|| IngestError::Deserialization("record has no value".to_string()))?;

        let command = ActionItemCommand::from_payload(payload)?;
        command.validate()?;

        let item = self.repository.save(command).await?;
        debug!(item_id = %item.id, "Action item stored");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::memory::MemoryBroker;
    use crate::store::MemoryActionItemRepository;
    use rstest::rstest;

    const VALID: &[u8] = br#"{"title":"Check valve","typeCode":"MNT","status":"OPEN"}"#;

    #[tokio::test]
    async fn test_valid_record_is_stored() {
        let repo = MemoryActionItemRepository::new();
        let pipeline = ProcessingPipeline::new(Arc::new(repo.clone()));
        let broker = MemoryBroker::new();

        let outcome = pipeline.process(&broker.record("items", 0, 0, None, Some(VALID))).await;
        assert!(outcome.is_success());
        assert_eq!(repo.items()[0].title, "Check valve");
    }

    #[rstest]
    #[case::tombstone(None, "DeserializationError")]
    #[case::garbage(Some(&b"not json"[..]), "DeserializationError")]
    #[case::invalid(Some(&br#"{"title":"x"}"#[..]), "ValidationError")]
    #[tokio::test]
    async fn test_failures_are_outcomes(#[case] value: Option<&[u8]>, #[case] kind: &str) {
        let repo = MemoryActionItemRepository::new();
        let pipeline = ProcessingPipeline::new(Arc::new(repo.clone()));
        let broker = MemoryBroker::new();

        match pipeline.process(&broker.record("items", 0, 0, None, value)).await {
            ProcessingOutcome::Failure(err) => assert_eq!(err.kind(), kind),
            ProcessingOutcome::Success(_) => panic!("expected failure"),
        }
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_storage_outage_is_persistence_failure() {
        let repo = MemoryActionItemRepository::new();
        repo.set_available(false);
        let pipeline = ProcessingPipeline::new(Arc::new(repo));
        let broker = MemoryBroker::new();

        match pipeline.process(&broker.record("items", 0, 0, None, Some(VALID))).await {
            ProcessingOutcome::Failure(err) => assert_eq!(err.kind(), "PersistenceError"),
            ProcessingOutcome::Success(_) => panic!("expected failure"),
        }
    }
}
