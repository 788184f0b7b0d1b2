use super::{ActionItemRepository, ErrorStore};
use crate::error::{IngestError, IngestResult};
use crate::model::{ActionItem, ActionItemCommand, ProcessingError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Action item repository kept in process memory.
///
/// Availability can be toggled to simulate a storage outage; while
/// unavailable both `save` and `ping` fail with a persistence error.
#[derive(Debug, Clone)]
pub struct MemoryActionItemRepository {
    items: Arc<RwLock<Vec<ActionItem>>>,
    available: Arc<AtomicBool>,
    save_delay: Arc<RwLock<Option<Duration>>>,
}

impl MemoryActionItemRepository {
    pub fn new() -> Self {
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            available: Arc::new(AtomicBool::new(true)),
            save_delay: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Make every save take at least `delay`
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.write() = delay;
    }

    pub fn items(&self) -> Vec<ActionItem> {
        self.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn check_available(&self) -> IngestResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(IngestError::Persistence("database unavailable".to_string()))
        }
    }
}

impl Default for MemoryActionItemRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionItemRepository for MemoryActionItemRepository {
    async fn save(&self, command: ActionItemCommand) -> IngestResult<ActionItem> {
        let delay = *self.save_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_available()?;
        let item = ActionItem::from_command(Uuid::new_v4(), command, Utc::now())?;
        self.items.write().push(item.clone());
        Ok(item)
    }

    async fn ping(&self) -> IngestResult<()> {
        self.check_available()
    }
}

/// Error store kept in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryErrorStore {
    errors: Arc<RwLock<Vec<ProcessingError>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryErrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every save while `failing` is set
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn errors(&self) -> Vec<ProcessingError> {
        self.errors.read().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.read().is_empty()
    }
}

#[async_trait]
impl ErrorStore for MemoryErrorStore {
    async fn save(&self, error: ProcessingError) -> IngestResult<ProcessingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IngestError::Persistence(
                "error store unavailable".to_string(),
            ));
        }
        self.errors.write().push(error.clone());
        Ok(error)
    }
}
