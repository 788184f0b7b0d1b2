//! Error capture: turns a failed unit of work into a persisted diagnostic record

use crate::consumer::metrics::IngestMetrics;
use crate::error::IngestError;
use crate::model::ProcessingError;
use crate::store::ErrorStore;
use std::sync::Arc;
use tracing::{debug, error};

/// Builds and persists [`ProcessingError`] records
#[derive(Clone)]
pub struct ErrorCapture {
    store: Arc<dyn ErrorStore>,
    metrics: IngestMetrics,
}

impl ErrorCapture {
    pub fn new(store: Arc<dyn ErrorStore>, metrics: IngestMetrics) -> Self {
        Self { store, metrics }
    }

    /// Record `error` for the payload that caused it.
    ///
    /// Store failures are logged and counted, never returned: capture must
    /// not stand between a record and its offset commit.
    pub async fn capture(
        &self,
        source: &str,
        error: &IngestError,
        payload: Option<&[u8]>,
    ) -> ProcessingError {
        let record = ProcessingError::from_error(source, error, payload);

        match self.store.save(record.clone()).await {
            Ok(saved) => {
                self.metrics.increment_captured();
                debug!(
                    error_id = %saved.id,
                    error_type = %saved.error_type,
                    source = %saved.source,
                    "Processing error captured"
                );
                saved
            }
            Err(store_error) => {
                self.metrics.increment_capture_failures();
                error!(
                    error_id = %record.id,
                    error_type = %record.error_type,
                    "Failed to persist processing error: {}",
                    store_error
                );
                record
            }
        }
    }
}
