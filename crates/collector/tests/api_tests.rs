//! Integration tests for the collector API endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use sentinel_collector::{
    api::{create_router, AppState},
    config::CollectorConfig,
    pipeline::Pipeline,
};
use sentinel_lib::{
    config::{ConfigStore, PipelineConfig, ProjectConfig},
    health::{components, HealthRegistry},
    ingest::{hash_credential, MemoryEventStore},
    observability::StructuredLogger,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const API_KEY: &str = "sentinel_3f2a9c";

struct TestApp {
    router: Router,
    pipeline: Pipeline,
    health: HealthRegistry,
    store: MemoryEventStore,
}

async fn setup_test_app() -> TestApp {
    let projects = ConfigStore::new(PipelineConfig {
        projects: vec![ProjectConfig::new("shop", hash_credential(API_KEY))],
    });
    let store = MemoryEventStore::new();
    let health = HealthRegistry::new();

    let pipeline = Pipeline::build(
        &CollectorConfig::default(),
        projects,
        Arc::new(store.clone()),
        health.clone(),
        StructuredLogger::new("api-test"),
    );
    let state = Arc::new(AppState::new(pipeline.gateway(), health.clone()));

    TestApp {
        router: create_router(state),
        pipeline,
        health,
        store,
    }
}

fn ingest_request(auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/ingest")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn captured(path: &str) -> Value {
    json!({
        "timestamp_ms": chrono::Utc::now().timestamp_millis(),
        "method": "GET",
        "path": path,
        "status_code": 200,
        "latency_ms": 18,
        "headers": {"authorization": "Bearer user-token"}
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_ingest_accepts_batch() {
    let app = setup_test_app().await;

    let body = json!({
        "requests": [captured("/orders"), {"method": "GET"}, captured("/cart")]
    });
    let response = app
        .router
        .oneshot(ingest_request(Some(&format!("Bearer {API_KEY}")), body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let receipt = json_body(response).await;
    assert_eq!(receipt["status"], "success");
    assert_eq!(receipt["accepted"], 2);
    assert_eq!(receipt["skipped"], 1);

    let stored = app.store.events().await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].sanitized_headers["authorization"], "[REDACTED]");
}

#[tokio::test]
async fn test_ingest_rejects_missing_or_unknown_key() {
    let app = setup_test_app().await;
    let body = json!({ "requests": [captured("/orders")] });

    let response = app
        .router
        .clone()
        .oneshot(ingest_request(None, body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");

    let response = app
        .router
        .oneshot(ingest_request(Some("Bearer sentinel_wrong"), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.store.len().await, 0);
}

#[tokio::test]
async fn test_ingest_rejects_malformed_batches() {
    let app = setup_test_app().await;
    let auth = format!("Bearer {API_KEY}");

    for body in [
        json!({ "requests": [] }),
        json!({ "requests": "nope" }),
        json!([captured("/orders")]),
    ] {
        let response = app
            .router
            .clone()
            .oneshot(ingest_request(Some(&auth), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["status"], "error");
    }
}

#[tokio::test]
async fn test_ingest_rate_limits_while_draining() {
    let app = setup_test_app().await;
    app.pipeline.shutdown(Duration::from_secs(5)).await;

    let response = app
        .router
        .oneshot(ingest_request(
            Some(&format!("Bearer {API_KEY}")),
            json!({ "requests": [captured("/orders")] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app().await;
    app.pipeline.mark_ready().await;

    app.health
        .set_degraded(components::EVENT_STORE, "slow disk")
        .await;

    let response = app.router.oneshot(get("/healthz")).await.unwrap();

    // Degraded still returns 200 (operational)
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;
    app.pipeline.mark_ready().await;

    app.health
        .set_unhealthy(components::DISPATCHER, "dispatcher stopped")
        .await;

    let response = app.router.oneshot(get("/healthz")).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_lifecycle() {
    let app = setup_test_app().await;

    let response = app.router.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["ready"], false);

    app.pipeline.mark_ready().await;
    let response = app.router.clone().oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["lifecycle"], "ready");

    app.pipeline.shutdown(Duration::from_secs(5)).await;
    let response = app.router.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["lifecycle"], "draining");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_pipeline_metrics() {
    let app = setup_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(ingest_request(
            Some(&format!("Bearer {API_KEY}")),
            json!({ "requests": [captured("/orders")] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("sentinel_events_ingested_total"));
    assert!(text.contains("sentinel_ingest_latency_seconds"));
}
