//! Tower middleware that records every request/response pair
//!
//! The wrapped service's response is intercepted on its way out, so the
//! status code and latency are read without touching the handler.

use super::Exporter;
use crate::models::CapturedRequest;
use http::{HeaderMap, Request, Response};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

#[derive(Debug, Clone)]
pub struct SentinelLayer {
    exporter: Exporter,
}

impl SentinelLayer {
    pub fn new(exporter: Exporter) -> Self {
        Self { exporter }
    }
}

impl<S> Layer<S> for SentinelLayer {
    type Service = SentinelService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SentinelService {
            inner,
            exporter: self.exporter.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentinelService<S> {
    inner: S,
    exporter: Exporter,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for SentinelService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let started = Instant::now();
        let pending = PendingCapture::from_request(&request, &self.exporter.config().country_header);
        let exporter = self.exporter.clone();
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            exporter.record(pending.complete(
                response.status().as_u16(),
                started.elapsed().as_millis() as u64,
            ));
            Ok(response)
        })
    }
}

/// Request-side fields, held until the response arrives
struct PendingCapture {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    query_params: BTreeMap<String, String>,
    ip: Option<String>,
    user_agent: Option<String>,
    country_code: Option<String>,
}

impl PendingCapture {
    fn from_request<B>(request: &Request<B>, country_header: &str) -> Self {
        let headers = request.headers();
        let query_params = request
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Self {
            method: request.method().as_str().to_string(),
            path: request.uri().path().to_string(),
            headers: header_map(headers),
            query_params,
            ip: client_ip(headers),
            user_agent: header_str(headers, http::header::USER_AGENT.as_str()),
            country_code: header_str(headers, country_header)
                .filter(|c| c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
                .map(|c| c.to_ascii_uppercase()),
        }
    }

    fn complete(self, status_code: u16, latency_ms: u64) -> CapturedRequest {
        CapturedRequest {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            method: self.method,
            path: self.path,
            status_code,
            latency_ms,
            headers: self.headers,
            query_params: self.query_params,
            ip: self.ip,
            user_agent: self.user_agent,
            country_code: self.country_code,
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Repeated headers are joined with ", "; non-UTF-8 values are skipped
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// First hop of `x-forwarded-for`, else `x-real-ip`
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
}
