//! Pipeline metrics collection

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Samples kept for duration statistics
const MAX_DURATION_SAMPLES: usize = 1000;

/// Pipeline metrics collector
#[derive(Debug, Clone)]
pub struct IngestMetrics {
    /// Records handed to the dispatcher by consumer loops
    pub records_consumed: Arc<AtomicU64>,
    /// Records accepted by the worker pool
    pub records_dispatched: Arc<AtomicU64>,
    /// Records persisted successfully
    pub records_succeeded: Arc<AtomicU64>,
    /// Records whose processing failed
    pub records_failed: Arc<AtomicU64>,
    /// Offsets committed
    pub offsets_committed: Arc<AtomicU64>,
    /// Commits that exhausted their retries
    pub commit_failures: Arc<AtomicU64>,
    /// Processing errors persisted to the error store
    pub errors_captured: Arc<AtomicU64>,
    /// Processing errors the error store rejected
    pub capture_failures: Arc<AtomicU64>,
    /// Failed payloads forwarded to the dead-letter sink
    pub dead_lettered: Arc<AtomicU64>,
    /// Poll cycles that exhausted their retries
    pub poll_failures: Arc<AtomicU64>,
    /// Health probes run
    pub health_probes: Arc<AtomicU64>,
    /// Failures by error kind
    error_counts: Arc<RwLock<BTreeMap<String, u64>>>,
    /// Processing durations
    processing_durations: Arc<RwLock<VecDeque<Duration>>>,
    start_time: Instant,
}

/// Duration statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationStats {
    pub count: usize,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub mean_ms: f64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub records_consumed: u64,
    pub records_dispatched: u64,
    pub records_succeeded: u64,
    pub records_failed: u64,
    pub offsets_committed: u64,
    pub commit_failures: u64,
    pub errors_captured: u64,
    pub capture_failures: u64,
    pub dead_lettered: u64,
    pub poll_failures: u64,
    pub health_probes: u64,
    pub errors_by_type: BTreeMap<String, u64>,
    pub processing: DurationStats,
}

impl IngestMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            records_consumed: Arc::new(AtomicU64::new(0)),
            records_dispatched: Arc::new(AtomicU64::new(0)),
            records_succeeded: Arc::new(AtomicU64::new(0)),
            records_failed: Arc::new(AtomicU64::new(0)),
            offsets_committed: Arc::new(AtomicU64::new(0)),
            commit_failures: Arc::new(AtomicU64::new(0)),
            errors_captured: Arc::new(AtomicU64::new(0)),
            capture_failures: Arc::new(AtomicU64::new(0)),
            dead_lettered: Arc::new(AtomicU64::new(0)),
            poll_failures: Arc::new(AtomicU64::new(0)),
            health_probes: Arc::new(AtomicU64::new(0)),
            error_counts: Arc::new(RwLock::new(BTreeMap::new())),
            processing_durations: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_DURATION_SAMPLES))),
            start_time: Instant::now(),
        }
    }

    pub fn increment_consumed(&self) {
        self.records_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dispatched(&self) {
        self.records_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_succeeded(&self) {
        self.records_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed record under its error kind
    pub fn increment_failed(&self, kind: &str) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
        self.record_error(kind);
    }

    pub fn increment_committed(&self) {
        self.offsets_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commit_failures(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_captured(&self) {
        self.errors_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_capture_failures(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_poll_failures(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_probes(&self) {
        self.health_probes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        let mut errors = self.error_counts.write();
        *errors.entry(error_type.to_string()).or_insert(0) += 1;
    }

    /// Record processing duration
    pub fn record_processing_duration(&self, duration: Duration) {
        let mut durations = self.processing_durations.write();
        if durations.len() >= MAX_DURATION_SAMPLES {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    /// Get processing statistics
    pub fn processing_stats(&self) -> DurationStats {
        let durations = self.processing_durations.read();
        if durations.is_empty() {
            return DurationStats::default();
        }

        let mut sorted: Vec<Duration> = durations.iter().copied().collect();
        drop(durations);
        sorted.sort_unstable();

        let p50_idx = sorted.len() / 2;
        let p99_idx = ((sorted.len() - 1) as f64 * 0.99) as usize;
        let total: Duration = sorted.iter().sum();

        DurationStats {
            count: sorted.len(),
            p50_ms: millis(sorted[p50_idx]),
            p99_ms: millis(sorted[p99_idx]),
            mean_ms: millis(total) / sorted.len() as f64,
        }
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            records_succeeded: self.records_succeeded.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            offsets_committed: self.offsets_committed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            errors_captured: self.errors_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            health_probes: self.health_probes.load(Ordering::Relaxed),
            errors_by_type: self.error_counts.read().clone(),
            processing: self.processing_stats(),
        }
    }
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
