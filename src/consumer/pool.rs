//! Bounded worker pool shared by every consumer loop
//!
//! Core workers live as long as the pool and drain a bounded queue. When the
//! queue is full the pool grows with overflow workers up to `max_size`; those
//! exit after `keep_alive` without work. Once all workers are busy and the
//! queue is full, [`WorkerPool::submit`] waits for room instead of rejecting.

use crate::config::WorkerPoolConfig;
use crate::error::{IngestError, IngestResult};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info};

/// A unit of work run to completion by one worker
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    pub peak_active: usize,
    pub queued: usize,
    pub completed: u64,
}

#[derive(Debug)]
struct PoolShared {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    workers: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicU64,
}

impl PoolShared {
    async fn run(&self, job: Job) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!("Unit of work panicked inside the worker pool");
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    async fn next_job(&self, idle_timeout: Option<Duration>) -> Option<Job> {
        let next = async { self.receiver.lock().await.recv().await };
        match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, next).await.ok().flatten(),
            None => next.await,
        }
    }
}

/// Bounded pool of tokio tasks executing dispatched units of work
#[derive(Debug)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create the pool and start its core workers. Must be called inside a runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let shared = Arc::new(PoolShared {
            receiver: tokio::sync::Mutex::new(receiver),
            workers: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        });

        let pool = Self {
            config,
            sender: Mutex::new(Some(sender)),
            shared,
        };

        for _ in 0..pool.config.core_size.max(1) {
            pool.shared.workers.fetch_add(1, Ordering::SeqCst);
            pool.spawn_worker(None, None);
        }

        info!(
            core = pool.config.core_size,
            max = pool.config.max_size,
            queue = capacity,
            "Worker pool started"
        );
        pool
    }

    /// Hand a unit of work to the pool, waiting while the pool is saturated
    pub async fn submit(&self, job: Job) -> IngestResult<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| IngestError::Shutdown("worker pool is closed".to_string()))?;

        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                if self.reserve_overflow_worker() {
                    self.spawn_worker(Some(job), Some(self.config.keep_alive));
                    return Ok(());
                }

                debug!("Worker pool saturated, submitter waiting for queue space");
                sender
                    .send(job)
                    .await
                    .map_err(|_| IngestError::Shutdown("worker pool is closed".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(IngestError::Shutdown("worker pool is closed".to_string()))
            }
        }
    }

    /// Stop accepting work. Queued units still run.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!("Worker pool closed");
        }
    }

    pub fn stats(&self) -> PoolStats {
        let queued = self
            .sender
            .lock()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0);

        PoolStats {
            workers: self.shared.workers.load(Ordering::SeqCst),
            active: self.shared.active.load(Ordering::SeqCst),
            peak_active: self.shared.peak_active.load(Ordering::SeqCst),
            queued,
            completed: self.shared.completed.load(Ordering::Relaxed),
        }
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Highest number of units ever running at once
    pub fn peak_active(&self) -> usize {
        self.shared.peak_active.load(Ordering::SeqCst)
    }

    fn reserve_overflow_worker(&self) -> bool {
        let max = self.config.max_size.max(self.config.core_size).max(1);
        self.shared
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn spawn_worker(&self, first: Option<Job>, idle_timeout: Option<Duration>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Some(job) = first {
                shared.run(job).await;
            }

            while let Some(job) = shared.next_job(idle_timeout).await {
                shared.run(job).await;
            }

            let remaining = shared.workers.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!(remaining, overflow = idle_timeout.is_some(), "Worker exited");
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    fn config(core: usize, max: usize, queue: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            core_size: core,
            max_size: max,
            queue_capacity: queue,
            keep_alive: Duration::from_millis(50),
        }
    }

    fn gated(gate: &Arc<Semaphore>) -> Job {
        let gate = gate.clone();
        Box::pin(async move {
            let _permit = gate.acquire().await;
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_saturated_pool_blocks_submitter() {
        let pool = Arc::new(WorkerPool::new(config(1, 2, 1)));
        let gate = Arc::new(Semaphore::new(0));

        pool.submit(gated(&gate)).await.unwrap();
        wait_until(|| pool.active_count() == 1).await;

        // queued behind the busy core worker
        pool.submit(gated(&gate)).await.unwrap();
        assert_eq!(pool.stats().queued, 1);

        // queue full, so an overflow worker takes it
        pool.submit(gated(&gate)).await.unwrap();
        wait_until(|| pool.active_count() == 2).await;

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.submit(gated(&gate))).await;
        assert!(blocked.is_err(), "fourth submission should wait");

        gate.add_permits(16);
        let late = {
            let pool = pool.clone();
            let gate = gate.clone();
            tokio::spawn(async move { pool.submit(gated(&gate)).await })
        };
        late.await.unwrap().unwrap();

        wait_until(|| pool.stats().completed == 4).await;
        assert!(pool.peak_active() <= 2);
    }

    #[tokio::test]
    async fn test_overflow_workers_retire_when_idle() {
        let pool = WorkerPool::new(config(1, 3, 1));
        let gate = Arc::new(Semaphore::new(0));

        for _ in 0..4 {
            pool.submit(gated(&gate)).await.unwrap();
        }
        assert_eq!(pool.stats().workers, 3);

        gate.add_permits(16);
        wait_until(|| pool.stats().completed == 4).await;
        wait_until(|| pool.stats().workers == 1).await;
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(config(1, 1, 4));
        pool.submit(Box::pin(async { panic!("boom") })).await.unwrap();
        pool.submit(Box::pin(async {})).await.unwrap();

        wait_until(|| pool.stats().completed == 2).await;
        assert_eq!(pool.stats().workers, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = WorkerPool::new(config(1, 1, 1));
        pool.close();
        let err = pool.submit(Box::pin(async {})).await.unwrap_err();
        assert_eq!(err.kind(), "ShutdownError");
    }
}
