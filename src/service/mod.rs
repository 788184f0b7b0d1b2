//! Diagnostic HTTP interface on the Tokio stack using Axum
//!
//! Read-only views of persistence health, consumer gating, pool occupancy and
//! pipeline counters, plus one action: an immediate health probe.

use crate::consumer::consumer::ConsumerStatus;
use crate::consumer::metrics::{IngestMetrics, MetricsSnapshot};
use crate::consumer::pool::{PoolStats, WorkerPool};
use crate::consumer::registrar::ConsumerRegistry;
use crate::health::{BackpressureController, HealthStatus};
use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post, Router},
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Maximum request body size (64KB)
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum concurrent requests
const MAX_CONCURRENT_REQUESTS: usize = 256;

/// Header carrying the key for the probe trigger
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct DiagnosticService {
    controller: Arc<BackpressureController>,
    registry: Arc<ConsumerRegistry>,
    pool: Arc<WorkerPool>,
    metrics: IngestMetrics,
    api_key: Option<Arc<str>>,
    start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

/// Persistence health as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub millis_since_last_success: u64,
}

impl From<HealthStatus> for DatabaseHealth {
    fn from(status: HealthStatus) -> Self {
        Self {
            healthy: status.healthy,
            consecutive_failures: status.consecutive_failures,
            millis_since_last_success: status.since_last_success.as_millis() as u64,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsumersResponse {
    paused: bool,
    consumers: Vec<ConsumerStatus>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    state: &'static str,
    database: DatabaseHealth,
    consumers: ConsumersResponse,
    pool: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct MemoryUsage {
    used_bytes: u64,
    total_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    memory: MemoryUsage,
    pipeline: MetricsSnapshot,
    pool: PoolStats,
}

impl DiagnosticService {
    pub fn new(
        controller: Arc<BackpressureController>,
        registry: Arc<ConsumerRegistry>,
        pool: Arc<WorkerPool>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            controller,
            registry,
            pool,
            metrics,
            api_key: None,
            start_time: Instant::now(),
        }
    }

    /// Require `key` in the `x-api-key` header to trigger probes
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(Arc::from(key.into()));
        self
    }

    pub fn router(&self) -> Router {
        let actions = Router::new()
            .route("/diagnostics/database/check", post(Self::check_database_handler))
            .route_layer(middleware::from_fn_with_state(
                self.clone(),
                Self::auth_middleware,
            ));

        let app = Router::new()
            .route("/health", get(Self::health_handler))
            .route("/diagnostics/database", get(Self::database_handler))
            .route("/diagnostics/consumers", get(Self::consumers_handler))
            .route("/diagnostics/status", get(Self::status_handler))
            .route("/diagnostics/metrics", get(Self::metrics_handler))
            .merge(actions)
            .with_state(self.clone());

        app.layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
            .layer(TimeoutLayer::new(DEFAULT_TIMEOUT))
            .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    async fn auth_middleware(
        State(service): State<DiagnosticService>,
        request: Request,
        next: Next,
    ) -> Result<Response, StatusCode> {
        let Some(expected) = service.api_key.as_deref() else {
            return Ok(next.run(request).await);
        };

        match request.headers().get(API_KEY_HEADER) {
            Some(key) if key.as_bytes() == expected.as_bytes() => Ok(next.run(request).await),
            _ => {
                warn!(path = %request.uri().path(), "Rejected diagnostic action without valid key");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }

    async fn health_handler(State(service): State<DiagnosticService>) -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: crate::VERSION.to_string(),
            uptime_seconds: service.start_time.elapsed().as_secs(),
        })
    }

    async fn database_handler(State(service): State<DiagnosticService>) -> Json<DatabaseHealth> {
        Json(service.controller.status().into())
    }

    async fn consumers_handler(State(service): State<DiagnosticService>) -> Json<ConsumersResponse> {
        Json(service.consumers())
    }

    async fn status_handler(State(service): State<DiagnosticService>) -> Json<StatusResponse> {
        let health = service.controller.status();
        Json(StatusResponse {
            state: if health.consumers_paused { "DEGRADED" } else { "HEALTHY" },
            database: health.into(),
            consumers: service.consumers(),
            pool: service.pool.stats(),
        })
    }

    async fn metrics_handler(State(service): State<DiagnosticService>) -> Json<MetricsResponse> {
        let mut system = System::new();
        system.refresh_memory();

        Json(MetricsResponse {
            memory: MemoryUsage {
                used_bytes: system.used_memory(),
                total_bytes: system.total_memory(),
            },
            pipeline: service.metrics.snapshot(),
            pool: service.pool.stats(),
        })
    }

    async fn check_database_handler(State(service): State<DiagnosticService>) -> Json<DatabaseHealth> {
        info!("Manual health probe requested");
        Json(service.controller.probe_now().await.into())
    }

    fn consumers(&self) -> ConsumersResponse {
        ConsumersResponse {
            paused: self.controller.is_degraded() || self.registry.all_paused(),
            consumers: self.registry.statuses(),
        }
    }

    /// Serve until `shutdown` completes
    pub async fn serve<F>(
        self,
        addr: SocketAddr,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        info!("Starting diagnostic service on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;

        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("Server error: {}", e);
            return Err(e.into());
        }

        Ok(())
    }
}
