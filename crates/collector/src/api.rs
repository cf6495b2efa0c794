//! HTTP API: batch ingestion, health checks and Prometheus metrics

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use sentinel_lib::{
    health::{ComponentStatus, HealthRegistry},
    ingest::IngestGateway,
    IngestError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestGateway>,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(gateway: Arc<IngestGateway>, health_registry: HealthRegistry) -> Self {
        Self {
            gateway,
            health_registry,
        }
    }
}

/// Credential from `Authorization`, with or without the `Bearer` scheme
fn credential(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        None if value.eq_ignore_ascii_case("bearer") => "",
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

/// The `requests` array of an ingestion body
fn parse_batch(body: &[u8]) -> Result<Vec<Value>, String> {
    let mut body: Value =
        serde_json::from_slice(body).map_err(|e| format!("body is not valid JSON: {e}"))?;
    match body.get_mut("requests").map(Value::take) {
        Some(Value::Array(requests)) => Ok(requests),
        Some(_) => Err("`requests` must be an array".to_string()),
        None => Err("missing `requests` array".to_string()),
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({ "status": "error", "error": message.into() });
    (status, Json(body)).into_response()
}

fn unauthorized(message: &str) -> Response {
    let mut response = error_body(StatusCode::UNAUTHORIZED, message);
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

/// Map a gateway failure to its HTTP response
fn ingest_error_response(err: IngestError) -> Response {
    match err {
        IngestError::Unauthorized => unauthorized("invalid API key"),
        IngestError::Malformed(message) => error_body(StatusCode::BAD_REQUEST, message),
        IngestError::RateLimited { retry_after_secs } => {
            let mut response =
                error_body(StatusCode::TOO_MANY_REQUESTS, "collector is saturated, retry later");
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            response
        }
        IngestError::Unavailable(message) => {
            error!(error = %message, "Ingestion unavailable");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "event store unavailable")
        }
    }
}

/// Accept a batch of captured requests from an exporter
async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(credential) = credential(&headers) else {
        return unauthorized("missing API key");
    };
    let batch = match parse_batch(&body) {
        Ok(batch) => batch,
        Err(message) => return error_body(StatusCode::BAD_REQUEST, message),
    };

    match state.gateway.ingest(credential, batch).await {
        Ok(receipt) => (
            StatusCode::CREATED,
            Json(json!({
                "status": "success",
                "accepted": receipt.accepted,
                "skipped": receipt.skipped,
            })),
        )
            .into_response(),
        Err(e) => ingest_error_response(e),
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind the API server's listener
pub async fn bind(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");
    Ok(tokio::net::TcpListener::bind(&addr).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_accepts_bearer_or_raw_key() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk_live".parse().unwrap());
        assert_eq!(credential(&headers), Some("sk_live"));

        headers.insert(header::AUTHORIZATION, "sk_raw".parse().unwrap());
        assert_eq!(credential(&headers), Some("sk_raw"));

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(credential(&headers), None);
    }

    #[test]
    fn test_parse_batch_requires_requests_array() {
        assert_eq!(parse_batch(br#"{"requests":[1,2]}"#).unwrap().len(), 2);
        assert!(parse_batch(br#"{"requests":{}}"#).is_err());
        assert!(parse_batch(br#"[]"#).is_err());
        assert!(parse_batch(b"not json").is_err());
    }
}
