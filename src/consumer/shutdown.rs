//! Graceful shutdown management for consumer loops and in-flight work

use crate::error::{IngestError, IngestResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{watch, Notify};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shared shutdown state: the stop signal plus the in-flight unit counter
#[derive(Debug)]
pub struct ShutdownState {
    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
    /// Whether every in-flight unit drained before the deadline
    shutdown_complete: AtomicBool,
    /// Units of work submitted to the pool and not yet acknowledged
    inflight: AtomicUsize,
    /// Woken whenever the in-flight count drops to zero
    drained: Notify,
    /// Broadcast to consumer loops and the health scheduler
    signal: watch::Sender<bool>,
    shutdown_start: Mutex<Option<Instant>>,
}

impl ShutdownState {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            shutting_down: AtomicBool::new(false),
            shutdown_complete: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            signal,
            shutdown_start: Mutex::new(None),
        }
    }

    /// Receiver that flips to `true` once shutdown begins
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Begin the shutdown process. Idempotent.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shutdown_start.lock() = Some(Instant::now());
        self.signal.send_replace(true);
        info!(inflight = self.inflight_count(), "Shutdown initiated");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::SeqCst)
    }

    /// Track a unit of work handed to the pool
    pub fn add_inflight(&self) {
        let count = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("In-flight units: {}", count);
    }

    /// Release a unit of work once its offset has been acknowledged
    pub fn remove_inflight(&self) {
        let previous = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Time since shutdown began
    pub fn shutdown_duration(&self) -> Option<Duration> {
        self.shutdown_start.lock().map(|start| start.elapsed())
    }

    /// Wait for every in-flight unit to finish, giving up after `timeout`
    pub async fn wait_for_completion(&self, timeout: Duration) -> IngestResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let drained = self.drained.notified();
            if self.inflight_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                let count = self.inflight_count();
                if count == 0 {
                    break;
                }
                warn!("Shutdown timeout with {} units still in flight", count);
                return Err(IngestError::Timeout(format!(
                    "{} units still in flight after {:?}",
                    count, timeout
                )));
            }
        }

        self.shutdown_complete.store(true, Ordering::SeqCst);
        if let Some(duration) = self.shutdown_duration() {
            info!("Shutdown completed in {:?}", duration);
        }
        Ok(())
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}
