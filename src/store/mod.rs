//! Persistence collaborators used by the pipeline
//!
//! The relational mapping lives outside this crate. Implementations only
//! need to satisfy these traits; the in-memory ones back local runs and tests.

use crate::error::IngestResult;
use crate::model::{ActionItem, ActionItemCommand, ProcessingError};
use async_trait::async_trait;

mod memory;

pub use memory::{MemoryActionItemRepository, MemoryErrorStore};

/// Storage for action items
#[async_trait]
pub trait ActionItemRepository: Send + Sync + 'static {
    /// Validate and persist a command, returning the stored item
    async fn save(&self, command: ActionItemCommand) -> IngestResult<ActionItem>;

    /// Lightweight connectivity check used by the health controller
    async fn ping(&self) -> IngestResult<()>;
}

/// Storage for captured processing errors
#[async_trait]
pub trait ErrorStore: Send + Sync + 'static {
    /// Persist a captured error, returning it with its stored id
    async fn save(&self, error: ProcessingError) -> IngestResult<ProcessingError>;
}
