//! Per-topic consumer loop
//!
//! Each registered topic gets one sequential loop: poll a batch, attach a
//! batch context, dispatch every record to the shared pool. Pausing is
//! cooperative and checked at the top of every iteration; dispatched work
//! keeps running while the loop is paused.

use crate::consumer::dispatcher::Dispatcher;
use crate::consumer::metrics::IngestMetrics;
use crate::consumer::record::CommitFailureSignal;
use crate::consumer::registrar::TopicRegistration;
use crate::consumer::retry::RetryExecutor;
use crate::consumer::source::RecordSource;
use crate::context::BatchContext;
use crate::error::IngestError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Externally visible state of one consumer loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub topic: String,
    pub group_id: String,
    pub paused: bool,
    pub running: bool,
}

/// Control surface for a spawned consumer loop
#[derive(Debug)]
pub struct ConsumerHandle {
    registration: TopicRegistration,
    paused: watch::Sender<bool>,
    started: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerHandle {
    pub fn registration(&self) -> &TopicRegistration {
        &self.registration
    }

    pub fn topic(&self) -> &str {
        &self.registration.topic
    }

    /// Let a loop registered without auto-start begin polling
    pub fn start(&self) {
        self.started.send_if_modified(|started| !std::mem::replace(started, true));
    }

    /// Stop fetching. No-op when already paused.
    pub fn pause(&self) {
        if self.paused.send_if_modified(|paused| !std::mem::replace(paused, true)) {
            info!(topic = %self.registration.topic, "Pause requested");
        }
    }

    /// Resume fetching. No-op when not paused.
    pub fn resume(&self) {
        if self.paused.send_if_modified(|paused| std::mem::replace(paused, false)) {
            info!(topic = %self.registration.topic, "Resume requested");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Whether the loop is polling or waiting while paused
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus {
            topic: self.registration.topic.clone(),
            group_id: self.registration.group_id.clone(),
            paused: self.is_paused(),
            running: self.is_running(),
        }
    }

    /// Wait for the loop task to exit
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(topic = %self.registration.topic, "Consumer task failed: {}", e);
            }
        }
    }
}

/// One topic's sequential poll loop
pub struct TopicConsumer {
    registration: TopicRegistration,
    source: Arc<dyn RecordSource>,
    dispatcher: Dispatcher,
    retry: RetryExecutor,
    batch_size: usize,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    metrics: IngestMetrics,
}

impl TopicConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration: TopicRegistration,
        source: Arc<dyn RecordSource>,
        dispatcher: Dispatcher,
        retry: RetryExecutor,
        batch_size: usize,
        poll_timeout: Duration,
        shutdown: watch::Receiver<bool>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            registration,
            source,
            dispatcher,
            retry,
            batch_size,
            poll_timeout,
            shutdown,
            metrics,
        }
    }

    /// Spawn the loop and return its handle
    pub fn spawn(self) -> ConsumerHandle {
        let (paused, paused_rx) = watch::channel(false);
        let (started, started_rx) = watch::channel(self.registration.auto_start);
        let running = Arc::new(AtomicBool::new(false));
        let registration = self.registration.clone();

        let span = info_span!(
            "consumer",
            topic = %registration.topic,
            group_id = %registration.group_id,
        );
        let task = tokio::spawn(self.run(paused_rx, started_rx, running.clone()).instrument(span));

        ConsumerHandle {
            registration,
            paused,
            started,
            running,
            task: Mutex::new(Some(task)),
        }
    }

    /// Shutdown was signalled, or its sender is gone
    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn run(
        mut self,
        mut paused_rx: watch::Receiver<bool>,
        mut started_rx: watch::Receiver<bool>,
        running: Arc<AtomicBool>,
    ) {
        while !*started_rx.borrow_and_update() {
            tokio::select! {
                changed = started_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.shutdown.changed() => {}
            }
            if self.stopping() {
                return;
            }
        }

        running.store(true, Ordering::SeqCst);
        info!("Consumer loop started");

        let consumer_name = self.registration.consumer_name();
        let commit_signal = Arc::new(CommitFailureSignal::new());
        let backoff = self.retry.policy().next_backoff(1);
        let mut source_paused = false;

        'poll: loop {
            if self.stopping() {
                break;
            }

            if *paused_rx.borrow_and_update() {
                if !source_paused {
                    if let Err(e) = self.source.pause().await {
                        warn!("Failed to pause source: {}", e);
                    }
                    source_paused = true;
                    info!("Consumer paused");
                }

                let source = self.source.clone();
                tokio::select! {
                    changed = paused_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.shutdown.changed() => {}
                    idle = source.idle(self.poll_timeout) => {
                        if let Err(e) = idle {
                            warn!("Error while idling paused source: {}", e);
                        }
                    }
                }
                continue;
            }

            if source_paused {
                if let Err(e) = self.source.resume().await {
                    warn!("Failed to resume source: {}", e);
                }
                source_paused = false;
                info!("Consumer resumed");
            }

            let failed_commits = commit_signal.take();
            if failed_commits > 0 {
                warn!(failed_commits, "Offset commits failed, backing off for {:?}", backoff);
                self.sleep_or_stop(backoff).await;
                continue;
            }

            let source = self.source.clone();
            let (batch_size, poll_timeout) = (self.batch_size, self.poll_timeout);
            let polled = self
                .retry
                .execute_with_predicate(
                    || source.poll(batch_size, poll_timeout),
                    IngestError::is_retryable,
                )
                .await
                .into_result();

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    error!("Poll cycle failed, backing off for {:?}: {}", backoff, e);
                    self.metrics.increment_poll_failures();
                    self.metrics.record_error("poll_failed");
                    self.sleep_or_stop(backoff).await;
                    continue;
                }
            };

            if records.is_empty() {
                continue;
            }

            let batch = BatchContext::new(&self.registration.group_id, &consumer_name);
            let batch_span = info_span!(
                "batch",
                correlation_id = %batch.correlation_id(),
                records = records.len(),
            );
            debug!(parent: &batch_span, "Dispatching batch");

            for record in records {
                let record = record.with_commit_signal(commit_signal.clone());
                let dispatched = self
                    .dispatcher
                    .dispatch(record, batch.snapshot())
                    .instrument(batch_span.clone())
                    .await;

                if let Err(e) = dispatched {
                    warn!("Dispatch rejected, stopping consumer: {}", e);
                    break 'poll;
                }
            }
        }

        self.source.close().await;
        running.store(false, Ordering::SeqCst);
        info!("Consumer loop stopped");
    }

    async fn sleep_or_stop(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}
