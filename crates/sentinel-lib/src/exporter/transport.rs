//! Batch delivery from the exporter to the collector

use crate::error::TransportError;
use crate::models::CapturedRequest;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Sends one batch to the collector
#[async_trait]
pub trait BatchTransport: Send + Sync + 'static {
    async fn send(&self, batch: &[CapturedRequest]) -> Result<(), TransportError>;
}

#[derive(Serialize)]
struct IngestBody<'a> {
    requests: &'a [CapturedRequest],
}

/// Posts batches to `{collector_url}/api/ingest` with a bearer credential.
/// A path in `collector_url` is kept as a prefix.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: String,
}

impl HttpTransport {
    pub fn new(
        collector_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut base = url::Url::parse(collector_url)
            .map_err(|e| TransportError::Failed(format!("invalid collector url: {e}")))?;
        // Keep any path prefix the collector is mounted under
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("api/ingest")
            .map_err(|e| TransportError::Failed(format!("invalid collector url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn send(&self, batch: &[CapturedRequest]) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&IngestBody { requests: batch })
            .send()
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {
                debug!(events = batch.len(), "Batch accepted by collector");
                Ok(())
            }
            401 | 403 => Err(TransportError::Unauthorized),
            400 | 422 => {
                let body = response.text().await.unwrap_or_default();
                Err(TransportError::Malformed(body))
            }
            429 | 503 => Err(TransportError::RateLimited),
            other => Err(TransportError::Failed(format!(
                "collector responded with status {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn batch() -> Vec<CapturedRequest> {
        vec![CapturedRequest {
            timestamp_ms: 1_700_000_000_000,
            method: "POST".to_string(),
            path: "/login".to_string(),
            status_code: 200,
            latency_ms: 12,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            country_code: None,
        }]
    }

    fn transport(server: &mockito::Server) -> HttpTransport {
        HttpTransport::new(&server.url(), "sk_test", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_posts_batch_with_bearer() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingest")
            .match_header("authorization", "Bearer sk_test")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"requests":[{"path":"/login","status_code":200}]}"#.to_string(),
            ))
            .with_status(201)
            .with_body(r#"{"status":"success","accepted":1,"skipped":0}"#)
            .create_async()
            .await;

        transport(&server).send(&batch()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_maps_collector_verdicts() {
        let mut server = mockito::Server::new_async().await;
        let transport = transport(&server);

        for (status, check) in [
            (401, "unauthorized"),
            (422, "malformed"),
            (429, "rate_limited"),
            (503, "rate_limited"),
            (500, "failed"),
        ] {
            let mock = server
                .mock("POST", "/api/ingest")
                .with_status(status)
                .create_async()
                .await;

            let err = transport.send(&batch()).await.unwrap_err();
            let matched = match check {
                "unauthorized" => matches!(err, TransportError::Unauthorized),
                "malformed" => matches!(err, TransportError::Malformed(_)),
                "rate_limited" => matches!(err, TransportError::RateLimited),
                _ => matches!(err, TransportError::Failed(_)),
            };
            assert!(matched, "status {status} mapped to {err:?}");
            mock.remove_async().await;
        }
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let timeout = Duration::from_secs(2);
        for (base, expected) in [
            ("http://collector:8080", "http://collector:8080/api/ingest"),
            ("http://collector:8080/", "http://collector:8080/api/ingest"),
            ("https://edge.example/sentinel", "https://edge.example/sentinel/api/ingest"),
            ("https://edge.example/sentinel/", "https://edge.example/sentinel/api/ingest"),
        ] {
            let transport = HttpTransport::new(base, "sk_test", timeout).unwrap();
            assert_eq!(transport.endpoint().as_str(), expected);
        }
    }

    #[tokio::test]
    async fn test_posts_under_path_prefix() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sentinel/api/ingest")
            .with_status(201)
            .create_async()
            .await;

        let url = format!("{}/sentinel", server.url());
        HttpTransport::new(&url, "sk_test", Duration::from_secs(2))
            .unwrap()
            .send(&batch())
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
