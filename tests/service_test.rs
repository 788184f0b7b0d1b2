#![cfg(feature = "service")]

mod common;

use action_ingest::IngestApp;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::{test_config, wait_until, Harness, MALFORMED, VALID};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

async fn send(app: Router, method: Method, uri: &str, api_key: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }

    let response = app
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::GET, uri, None).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = Harness::new();
    let app = IngestApp::start(test_config(&["orders"]), harness.collaborators())
        .await
        .unwrap();

    let (status, body) = get(app.diagnostic_service().router(), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], action_ingest::VERSION);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_database_endpoint_reports_probe_state() {
    let harness = Harness::new();
    let app = IngestApp::start(test_config(&["orders"]), harness.collaborators())
        .await
        .unwrap();
    wait_until(|| app.metrics().snapshot().health_probes >= 1).await;

    let (status, body) = get(app.diagnostic_service().router(), "/diagnostics/database").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["consecutive_failures"], 0);
    assert!(body["millis_since_last_success"].is_u64());

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_consumers_endpoint_lists_every_topic() {
    let harness = Harness::new();
    let app = IngestApp::start(test_config(&["orders", "tasks"]), harness.collaborators())
        .await
        .unwrap();

    let (status, body) = get(app.diagnostic_service().router(), "/diagnostics/consumers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], false);

    let consumers = body["consumers"].as_array().unwrap();
    assert_eq!(consumers.len(), 2);
    let mut topics: Vec<&str> = consumers
        .iter()
        .map(|c| c["topic"].as_str().unwrap())
        .collect();
    topics.sort_unstable();
    assert_eq!(topics, vec!["orders", "tasks"]);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_and_check_follow_repository_health() {
    let harness = Harness::new();
    let mut config = test_config(&["orders"]);
    config.health.failure_threshold = 1;
    let app = IngestApp::start(config, harness.collaborators()).await.unwrap();
    wait_until(|| app.metrics().snapshot().health_probes >= 1).await;
    let service = app.diagnostic_service();

    let (_, body) = get(service.router(), "/diagnostics/status").await;
    assert_eq!(body["state"], "HEALTHY");

    harness.repository.set_available(false);
    let (status, body) = send(
        service.router(),
        Method::POST,
        "/diagnostics/database/check",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], false);
    assert_eq!(body["consecutive_failures"], 1);

    let (_, body) = get(service.router(), "/diagnostics/status").await;
    assert_eq!(body["state"], "DEGRADED");
    assert_eq!(body["consumers"]["paused"], true);
    assert_eq!(body["database"]["healthy"], false);

    harness.repository.set_available(true);
    send(service.router(), Method::POST, "/diagnostics/database/check", None).await;
    let (_, body) = get(service.router(), "/diagnostics/status").await;
    assert_eq!(body["state"], "HEALTHY");

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint_reports_pipeline_counters() {
    let harness = Harness::new();
    let app = IngestApp::start(test_config(&["orders"]), harness.collaborators())
        .await
        .unwrap();

    harness.broker.produce("orders", 0, None, VALID);
    harness.broker.produce("orders", 0, None, MALFORMED);
    wait_until(|| harness.broker.commits().len() == 2).await;

    let (status, body) = get(app.diagnostic_service().router(), "/diagnostics/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pipeline"]["records_succeeded"], 1);
    assert_eq!(body["pipeline"]["records_failed"], 1);
    assert_eq!(body["pipeline"]["offsets_committed"], 2);
    assert_eq!(body["pipeline"]["errors_by_type"]["DeserializationError"], 1);
    assert!(body["memory"]["total_bytes"].is_u64());
    assert!(body["pool"]["workers"].as_u64().unwrap() >= 2);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_check_requires_configured_api_key() {
    let harness = Harness::new();
    let app = IngestApp::start(test_config(&["orders"]), harness.collaborators())
        .await
        .unwrap();
    let service = app.diagnostic_service().with_api_key("secret");

    let (status, _) = send(service.router(), Method::POST, "/diagnostics/database/check", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        service.router(),
        Method::POST,
        "/diagnostics/database/check",
        Some("wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        service.router(),
        Method::POST,
        "/diagnostics/database/check",
        Some("secret"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);

    // Read-only views stay open
    let (status, _) = get(service.router(), "/diagnostics/database").await;
    assert_eq!(status, StatusCode::OK);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let harness = Harness::new();
    let app = IngestApp::start(test_config(&["orders"]), harness.collaborators())
        .await
        .unwrap();

    let (status, _) = get(app.diagnostic_service().router(), "/diagnostics/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.shutdown().await.unwrap();
}
