//! Wiring of the full ingestion pipeline

use crate::config::IngestConfig;
use crate::consumer::dispatcher::Dispatcher;
use crate::consumer::memory::MemoryBroker;
use crate::consumer::metrics::IngestMetrics;
use crate::consumer::pool::WorkerPool;
use crate::consumer::registrar::{ConsumerRegistry, TopicRegistrar};
use crate::consumer::retry::RetryExecutor;
use crate::consumer::shutdown::ShutdownState;
use crate::consumer::source::RecordSourceFactory;
use crate::error::IngestResult;
use crate::health::{BackpressureController, HealthProbe, RepositoryProbe};
use crate::pipeline::{DeadLetterSink, ErrorCapture, ProcessingPipeline, ResultHandler};
use crate::store::{ActionItemRepository, ErrorStore, MemoryActionItemRepository, MemoryErrorStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// External systems the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Arc<dyn RecordSourceFactory>,
    pub repository: Arc<dyn ActionItemRepository>,
    pub error_store: Arc<dyn ErrorStore>,
    /// Defaults to pinging `repository`
    pub probe: Option<Arc<dyn HealthProbe>>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl Collaborators {
    pub fn new(
        sources: Arc<dyn RecordSourceFactory>,
        repository: Arc<dyn ActionItemRepository>,
        error_store: Arc<dyn ErrorStore>,
    ) -> Self {
        Self {
            sources,
            repository,
            error_store,
            probe: None,
            dead_letter: None,
        }
    }

    /// Everything backed by process memory
    pub fn in_memory(
        broker: &MemoryBroker,
        repository: &MemoryActionItemRepository,
        error_store: &MemoryErrorStore,
    ) -> Self {
        Self::new(
            Arc::new(broker.clone()),
            Arc::new(repository.clone()),
            Arc::new(error_store.clone()),
        )
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }
}

/// A running ingestion pipeline
pub struct IngestApp {
    config: IngestConfig,
    metrics: IngestMetrics,
    shutdown: Arc<ShutdownState>,
    pool: Arc<WorkerPool>,
    registry: Arc<ConsumerRegistry>,
    controller: Arc<BackpressureController>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestApp {
    /// Validate `config`, register every topic and start the health scheduler.
    ///
    /// Fails without leaving anything running if any topic cannot be
    /// registered.
    pub async fn start(config: IngestConfig, collaborators: Collaborators) -> IngestResult<Self> {
        config.ensure_valid()?;

        let metrics = IngestMetrics::new();
        let shutdown = Arc::new(ShutdownState::new());
        let pool = Arc::new(WorkerPool::new(config.worker_pool.clone()));

        let capture = ErrorCapture::new(collaborators.error_store.clone(), metrics.clone());
        let mut handler = ResultHandler::new(
            capture,
            RetryExecutor::new(config.retry_policy.clone()),
            metrics.clone(),
        );
        if let Some(sink) = collaborators.dead_letter.clone() {
            handler = handler.with_dead_letter(sink);
        }

        let dispatcher = Dispatcher::new(
            pool.clone(),
            ProcessingPipeline::new(collaborators.repository.clone()),
            handler,
            shutdown.clone(),
            metrics.clone(),
        );

        let registry = match TopicRegistrar::register_all(
            &config,
            collaborators.sources.as_ref(),
            dispatcher,
            shutdown.clone(),
            metrics.clone(),
        ) {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                error!("Startup aborted: {}", e);
                pool.close();
                return Err(e);
            }
        };

        let probe = collaborators
            .probe
            .clone()
            .unwrap_or_else(|| Arc::new(RepositoryProbe::new(collaborators.repository.clone())));
        let controller = Arc::new(BackpressureController::new(
            probe,
            registry.clone(),
            config.health.clone(),
            metrics.clone(),
        ));
        let health_task = controller.clone().spawn(shutdown.subscribe());

        info!(
            topics = ?config.topics,
            group_id_prefix = %config.group_id_prefix,
            "Ingestion pipeline started"
        );

        Ok(Self {
            config,
            metrics,
            shutdown,
            pool,
            registry,
            controller,
            health_task: Mutex::new(Some(health_task)),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &Arc<BackpressureController> {
        &self.controller
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn shutdown_state(&self) -> &Arc<ShutdownState> {
        &self.shutdown
    }

    /// Release loops registered with `auto_start = false`. Idempotent.
    pub fn start_consumers(&self) {
        if self.shutdown.is_shutting_down() {
            warn!("Not starting consumers during shutdown");
            return;
        }
        self.registry.start_all();
        info!(consumers = self.registry.len(), "Consumers started");
    }

    #[cfg(feature = "service")]
    pub fn diagnostic_service(&self) -> crate::service::DiagnosticService {
        crate::service::DiagnosticService::new(
            self.controller.clone(),
            self.registry.clone(),
            self.pool.clone(),
            self.metrics.clone(),
        )
    }

    /// Stop polling, stop probing, then wait for in-flight work
    pub async fn shutdown(&self) -> IngestResult<()> {
        self.shutdown.begin_shutdown();
        self.registry.join_all().await;

        let health_task = self.health_task.lock().take();
        if let Some(task) = health_task {
            if let Err(e) = task.await {
                error!("Health scheduler failed: {}", e);
            }
        }

        self.pool.close();
        self.shutdown
            .wait_for_completion(self.config.shutdown_timeout)
            .await
    }
}
