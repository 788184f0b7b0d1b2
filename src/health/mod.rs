//! Health-driven backpressure
//!
//! [`BackpressureController`] probes the persistence layer on a schedule.
//! After `failure_threshold` consecutive failures it pauses every registered
//! consumer (DEGRADED); the next successful probe resumes them (HEALTHY).
//! Consumers are never closed or re-registered, and dispatched work keeps
//! running while they are paused.
//!
//! The status is written only by the tick holding `tick_guard` and published
//! through a version counter, so readers never wait on the scheduler.

use crate::config::HealthConfig;
use crate::consumer::metrics::IngestMetrics;
use crate::consumer::registrar::ConsumerRegistry;
use crate::error::{IngestError, IngestResult};
use crate::store::ActionItemRepository;
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lightweight connectivity check
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self) -> IngestResult<()>;
}

/// Probes by pinging the action item repository
#[derive(Clone)]
pub struct RepositoryProbe {
    repository: Arc<dyn ActionItemRepository>,
}

impl RepositoryProbe {
    pub fn new(repository: Arc<dyn ActionItemRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl HealthProbe for RepositoryProbe {
    async fn probe(&self) -> IngestResult<()> {
        self.repository.ping().await
    }
}

/// What the controller pauses and resumes
pub trait ConsumerControl: Send + Sync + 'static {
    fn pause_all(&self);
    fn resume_all(&self);
}

impl ConsumerControl for ConsumerRegistry {
    fn pause_all(&self) {
        ConsumerRegistry::pause_all(self);
    }

    fn resume_all(&self) {
        ConsumerRegistry::resume_all(self);
    }
}

/// Snapshot of persistence health and consumer gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// Result of the most recent probe
    pub healthy: bool,
    pub consecutive_failures: u32,
    #[serde(rename = "millis_since_last_success", serialize_with = "as_millis")]
    pub since_last_success: Duration,
    /// True while DEGRADED
    pub consumers_paused: bool,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Versioned health fields; one writer at a time, lock-free readers
#[derive(Debug)]
struct HealthState {
    version: AtomicU64,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Millis after `epoch`
    last_success: AtomicU64,
    paused: AtomicBool,
    epoch: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Fields {
    healthy: bool,
    consecutive_failures: u32,
    last_success: u64,
    paused: bool,
}

impl HealthState {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_success: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn read(&self) -> Fields {
        loop {
            let before = self.version.load(Ordering::SeqCst);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let fields = Fields {
                healthy: self.healthy.load(Ordering::SeqCst),
                consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
                last_success: self.last_success.load(Ordering::SeqCst),
                paused: self.paused.load(Ordering::SeqCst),
            };
            if self.version.load(Ordering::SeqCst) == before {
                return fields;
            }
        }
    }

    /// Caller must hold the controller's tick guard
    fn write(&self, fields: Fields) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.healthy.store(fields.healthy, Ordering::SeqCst);
        self.consecutive_failures
            .store(fields.consecutive_failures, Ordering::SeqCst);
        self.last_success.store(fields.last_success, Ordering::SeqCst);
        self.paused.store(fields.paused, Ordering::SeqCst);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    fn status(&self) -> HealthStatus {
        let fields = self.read();
        HealthStatus {
            healthy: fields.healthy,
            consecutive_failures: fields.consecutive_failures,
            since_last_success: Duration::from_millis(
                self.now_millis().saturating_sub(fields.last_success),
            ),
            consumers_paused: fields.paused,
        }
    }
}

/// Pauses and resumes consumers based on probe results
pub struct BackpressureController {
    probe: Arc<dyn HealthProbe>,
    consumers: Arc<dyn ConsumerControl>,
    config: HealthConfig,
    state: HealthState,
    tick_guard: Mutex<()>,
    metrics: IngestMetrics,
}

impl BackpressureController {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        consumers: Arc<dyn ConsumerControl>,
        config: HealthConfig,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            probe,
            consumers,
            config,
            state: HealthState::new(),
            tick_guard: Mutex::new(()),
            metrics,
        }
    }

    /// Current status; never waits on a running probe
    pub fn status(&self) -> HealthStatus {
        self.state.status()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.read().paused
    }

    /// Probe now and apply the result. Concurrent calls run one at a time.
    pub async fn probe_now(&self) -> HealthStatus {
        let _tick = self.tick_guard.lock().await;
        self.metrics.increment_probes();

        let result = match tokio::time::timeout(self.config.probe_timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout(format!(
                "health probe exceeded {:?}",
                self.config.probe_timeout
            ))),
        };

        let current = self.state.read();
        match result {
            Ok(()) => {
                if current.paused {
                    self.consumers.resume_all();
                    info!(
                        failures = current.consecutive_failures,
                        "Persistence recovered, resuming consumers"
                    );
                }
                self.state.write(Fields {
                    healthy: true,
                    consecutive_failures: 0,
                    last_success: self.state.now_millis(),
                    paused: false,
                });
                debug!("Health probe succeeded");
            }
            Err(e) => {
                let failures = current.consecutive_failures.saturating_add(1);
                let pause = !current.paused && failures >= self.config.failure_threshold;
                if pause {
                    self.consumers.pause_all();
                    warn!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "Persistence unhealthy, pausing consumers"
                    );
                } else {
                    warn!(failures, "Health probe failed: {}", e);
                }
                self.metrics.record_error("health_probe_failed");
                self.state.write(Fields {
                    healthy: false,
                    consecutive_failures: failures,
                    last_success: current.last_success,
                    paused: current.paused || pause,
                });
            }
        }

        self.state.status()
    }

    /// Run scheduled probes until `shutdown` flips
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval = ?self.config.probe_interval,
                threshold = self.config.failure_threshold,
                "Health scheduler started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.probe_now().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct SwitchProbe {
        failing: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for SwitchProbe {
        async fn probe(&self) -> IngestResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(IngestError::Persistence("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct CountingConsumers {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl ConsumerControl for CountingConsumers {
        fn pause_all(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_all(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller(threshold: u32) -> (BackpressureController, Arc<SwitchProbe>, Arc<CountingConsumers>) {
        let probe = Arc::new(SwitchProbe::default());
        let consumers = Arc::new(CountingConsumers::default());
        let config = HealthConfig {
            failure_threshold: threshold,
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(100),
        };
        let controller =
            BackpressureController::new(probe.clone(), consumers.clone(), config, IngestMetrics::new());
        (controller, probe, consumers)
    }

    #[tokio::test]
    async fn test_successes_keep_consumers_running() {
        let (controller, _, consumers) = controller(3);
        for _ in 0..5 {
            controller.probe_now().await;
        }

        let status = controller.status();
        assert!(status.healthy);
        assert_eq!(status.consecutive_failures, 0);
        assert!(!status.consumers_paused);
        assert_eq!(consumers.pauses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_threshold_pauses_then_recovery_resumes() {
        let (controller, probe, consumers) = controller(3);
        probe.failing.store(true, Ordering::SeqCst);

        controller.probe_now().await;
        controller.probe_now().await;
        assert!(!controller.status().consumers_paused);

        let status = controller.probe_now().await;
        assert!(status.consumers_paused);
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 3);

        // further failures do not pause again
        controller.probe_now().await;
        assert_eq!(consumers.pauses.load(Ordering::SeqCst), 1);

        probe.failing.store(false, Ordering::SeqCst);
        let status = controller.probe_now().await;
        assert!(!status.consumers_paused);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(consumers.resumes.load(Ordering::SeqCst), 1);

        // already healthy: no extra resume
        controller.probe_now().await;
        assert_eq!(consumers.resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_failure() {
        struct Hanging;

        #[async_trait]
        impl HealthProbe for Hanging {
            async fn probe(&self) -> IngestResult<()> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }

        let consumers = Arc::new(CountingConsumers::default());
        let config = HealthConfig {
            failure_threshold: 1,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(20),
        };
        let controller =
            BackpressureController::new(Arc::new(Hanging), consumers.clone(), config, IngestMetrics::new());

        let status = controller.probe_now().await;
        assert!(status.consumers_paused);
        assert_eq!(consumers.pauses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_manual_probes_are_serialized() {
        let (controller, probe, consumers) = controller(2);
        probe.failing.store(true, Ordering::SeqCst);
        let controller = Arc::new(controller);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.probe_now().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(controller.status().consecutive_failures, 8);
        assert_eq!(consumers.pauses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let (controller, probe, _) = controller(1);
        probe.failing.store(true, Ordering::SeqCst);
        let controller = Arc::new(controller);
        let (tx, rx) = watch::channel(false);

        let handle = controller.clone().spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.status().consumers_paused);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_status_serializes_millis() {
        let status = HealthStatus {
            healthy: true,
            consecutive_failures: 0,
            since_last_success: Duration::from_millis(1500),
            consumers_paused: false,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["millis_since_last_success"], 1500);
    }
}
