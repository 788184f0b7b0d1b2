//! Per-record dispatch onto the worker pool
//!
//! Each record becomes one unit of work. Inside the unit the captured context
//! snapshot is restored and scoped, the pipeline runs, and the result handler
//! commits the offset. A panic in the pipeline is turned into a failure
//! outcome so the record is still committed exactly once.

use crate::consumer::metrics::IngestMetrics;
use crate::consumer::pool::WorkerPool;
use crate::consumer::record::InboundRecord;
use crate::consumer::shutdown::ShutdownState;
use crate::context::ContextSnapshot;
use crate::error::{IngestError, IngestResult};
use crate::pipeline::{DispatchReport, ProcessingOutcome, ProcessingPipeline, ResultHandler};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::Instrument;

/// Completion handle for one dispatched record.
///
/// Dropping the handle does not cancel the work.
#[derive(Debug)]
pub struct DispatchHandle {
    rx: oneshot::Receiver<DispatchReport>,
}

impl Future for DispatchHandle {
    type Output = IngestResult<DispatchReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(IngestError::from))
    }
}

/// Submits records to the shared worker pool
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    pipeline: ProcessingPipeline,
    handler: ResultHandler,
    shutdown: Arc<ShutdownState>,
    metrics: IngestMetrics,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<WorkerPool>,
        pipeline: ProcessingPipeline,
        handler: ResultHandler,
        shutdown: Arc<ShutdownState>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            pool,
            pipeline,
            handler,
            shutdown,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Hand `record` to the pool. Waits while the pool is saturated.
    pub async fn dispatch(
        &self,
        record: InboundRecord,
        snapshot: ContextSnapshot,
    ) -> IngestResult<DispatchHandle> {
        let (tx, rx) = oneshot::channel();
        let pipeline = self.pipeline.clone();
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        let metrics = self.metrics.clone();

        self.metrics.increment_consumed();
        shutdown.add_inflight();

        let job = async move {
            let context = snapshot.restore(&record);
            let span = context.span();

            let unit = async move {
                let started = Instant::now();
                let outcome = match AssertUnwindSafe(pipeline.process(&record)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => ProcessingOutcome::Failure(IngestError::Panicked(panic_message(&*panic))),
                };
                metrics.record_processing_duration(started.elapsed());
                handler.on_complete(record, outcome).await
            };

            let report = context.scope(unit).instrument(span).await;
            shutdown.remove_inflight();
            let _ = tx.send(report);
        };

        if let Err(e) = self.pool.submit(Box::pin(job)).await {
            self.shutdown.remove_inflight();
            return Err(e);
        }
        self.metrics.increment_dispatched();

        Ok(DispatchHandle { rx })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
