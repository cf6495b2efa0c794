//! Pipeline scenarios spanning exporter, gateway, engine and dispatcher

use crate::alert::{AlertDispatcher, WebhookAdapter};
use crate::backoff::RetryPolicy;
use crate::config::{ChannelConfig, ConfigStore, PipelineConfig, ProjectConfig};
use crate::detect::{spawn_workers, DetectionEngine, EngineHandle};
use crate::error::{IngestError, TransportError};
use crate::exporter::{BatchTransport, Exporter, ExporterConfig, REDACTED};
use crate::health::HealthRegistry;
use crate::ingest::{
    hash_credential, IngestGateway, MemoryEventStore, StaticRegistry, ValidationLimits,
};
use crate::models::{AnomalyEvent, CapturedRequest, ChannelKind, DetectorKind};
use crate::observability::{PipelineMetrics, StructuredLogger};
use async_trait::async_trait;
use mockito::Matcher;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CREDENTIAL: &str = "sk_shop_live";

struct Pipeline {
    gateway: Arc<IngestGateway>,
    store: MemoryEventStore,
    engine: Arc<DetectionEngine>,
    workers: Vec<JoinHandle<()>>,
    anomaly_rx: mpsc::Receiver<AnomalyEvent>,
}

impl Pipeline {
    fn start(config: ConfigStore) -> Self {
        let metrics = PipelineMetrics::new();
        let logger = StructuredLogger::new("pipeline-test");
        let store = MemoryEventStore::new();

        let (engine_handle, receivers) = EngineHandle::channel(2, 1_000);
        let engine = Arc::new(DetectionEngine::new(
            config.clone(),
            metrics.clone(),
            logger.clone(),
        ));
        let (anomaly_tx, anomaly_rx) = mpsc::channel(100);
        let workers = spawn_workers(Arc::clone(&engine), receivers, anomaly_tx);

        let gateway = Arc::new(IngestGateway::new(
            Arc::new(StaticRegistry::new(config.clone())),
            Arc::new(store.clone()),
            config,
            engine_handle,
            ValidationLimits::default(),
            metrics,
            logger,
            HealthRegistry::new(),
        ));

        Self {
            gateway,
            store,
            engine,
            workers,
            anomaly_rx,
        }
    }

    /// Stop intake, let the workers drain and collect every anomaly
    async fn finish(mut self) -> Vec<AnomalyEvent> {
        drop(self.gateway.stop_accepting());
        for worker in self.workers {
            worker.await.unwrap();
        }
        let mut anomalies = Vec::new();
        while let Some(anomaly) = self.anomaly_rx.recv().await {
            anomalies.push(anomaly);
        }
        anomalies
    }
}

fn project(channels: Vec<ChannelConfig>) -> ProjectConfig {
    let mut project = ProjectConfig::new("shop", hash_credential(CREDENTIAL));
    project.detectors.rate_threshold = 5;
    project.detectors.window_secs = 10;
    project.detectors.cooldown_secs = 20;
    project.channels = channels;
    project
}

fn request(path: &str, timestamp_ms: i64) -> Value {
    json!({
        "timestamp_ms": timestamp_ms,
        "method": "POST",
        "path": path,
        "status_code": 200,
        "latency_ms": 40,
        "headers": {"content-type": "application/json"}
    })
}

#[tokio::test]
async fn test_rate_breach_produces_one_anomaly_and_one_webhook() {
    let mut server = mockito::Server::new_async().await;
    let webhook = server
        .mock("POST", "/hooks/alerts")
        .match_body(Matcher::PartialJsonString(
            r#"{"project_id":"shop","endpoint":"/login","detector":"rate"}"#.to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = ConfigStore::new(PipelineConfig {
        projects: vec![project(vec![ChannelConfig {
            id: "ops-webhook".to_string(),
            kind: ChannelKind::Webhook,
            target: format!("{}/hooks/alerts", server.url()),
            cooldown_secs: 600,
        }])],
    });
    let pipeline = Pipeline::start(config.clone());

    let base = chrono::Utc::now().timestamp_millis();
    let burst: Vec<Value> = (0..6).map(|i| request("/login", base + i * 1_000)).collect();
    let receipt = pipeline.gateway.ingest(CREDENTIAL, burst).await.unwrap();
    assert_eq!(receipt.accepted, 6);

    // Seventh request two seconds after the breach, inside the cooldown
    pipeline
        .gateway
        .ingest(CREDENTIAL, vec![request("/login", base + 7_000)])
        .await
        .unwrap();

    let store = pipeline.store.clone();
    let anomalies = pipeline.finish().await;
    assert_eq!(store.len().await, 7);
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].detector, DetectorKind::Rate);
    assert_eq!(anomalies[0].endpoint, "/login");
    assert_eq!(anomalies[0].summary.request_count, 6);

    let dispatcher = Arc::new(
        AlertDispatcher::new(
            config,
            RetryPolicy::default(),
            PipelineMetrics::new(),
            StructuredLogger::new("pipeline-test"),
        )
        .with_adapter(Arc::new(WebhookAdapter::default())),
    );
    let (tx, rx) = mpsc::channel(10);
    let worker = tokio::spawn(Arc::clone(&dispatcher).run(rx));
    for anomaly in &anomalies {
        // Delivered twice to the dispatcher, notified once
        tx.send(anomaly.clone()).await.unwrap();
        tx.send(anomaly.clone()).await.unwrap();
    }
    drop(tx);
    worker.await.unwrap();

    webhook.assert_async().await;
    assert_eq!(
        dispatcher.delivery_log().attempts_for(anomalies[0].id).len(),
        1
    );
}

#[tokio::test]
async fn test_endpoints_below_threshold_stay_quiet() {
    let config = ConfigStore::new(PipelineConfig {
        projects: vec![project(Vec::new())],
    });
    let pipeline = Pipeline::start(config);

    let base = chrono::Utc::now().timestamp_millis();
    let batch: Vec<Value> = (0..10)
        .map(|i| {
            let path = if i % 2 == 0 { "/login" } else { "/signup" };
            request(path, base + i * 100)
        })
        .collect();
    pipeline.gateway.ingest(CREDENTIAL, batch).await.unwrap();

    assert!(pipeline.finish().await.is_empty());
}

#[tokio::test]
async fn test_far_future_event_cannot_pin_windows() {
    let config = ConfigStore::new(PipelineConfig {
        projects: vec![project(Vec::new())],
    });
    let pipeline = Pipeline::start(config);
    let engine = Arc::clone(&pipeline.engine);

    let now = chrono::Utc::now().timestamp_millis();
    let ten_years_ms = 10 * 365 * 86_400_000i64;
    let receipt = pipeline
        .gateway
        .ingest(CREDENTIAL, vec![request("/login", now + ten_years_ms)])
        .await
        .unwrap();
    assert_eq!(receipt.accepted, 0);
    assert_eq!(receipt.skipped, 1);

    // One request a minute stays far below five per ten seconds
    for minute in -4..=4 {
        pipeline
            .gateway
            .ingest(CREDENTIAL, vec![request("/login", now + minute * 60_000)])
            .await
            .unwrap();
    }

    assert!(pipeline.finish().await.is_empty());
    assert_eq!(engine.shard_count(), 1);
    assert_eq!(engine.evict_idle(now + 86_400_000), 1);
    assert_eq!(engine.shard_count(), 0);
}

/// Feeds exporter batches straight into a gateway
struct GatewayTransport {
    gateway: Arc<IngestGateway>,
    credential: String,
}

#[async_trait]
impl BatchTransport for GatewayTransport {
    async fn send(&self, batch: &[CapturedRequest]) -> Result<(), TransportError> {
        let values = batch
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        match self.gateway.ingest(&self.credential, values).await {
            Ok(_) => Ok(()),
            Err(IngestError::Unauthorized) => Err(TransportError::Unauthorized),
            Err(IngestError::Malformed(m)) => Err(TransportError::Malformed(m)),
            Err(IngestError::RateLimited { .. }) => Err(TransportError::RateLimited),
            Err(IngestError::Unavailable(m)) => Err(TransportError::Failed(m)),
        }
    }
}

#[tokio::test]
async fn test_exported_requests_arrive_sanitized() {
    let config = ConfigStore::new(PipelineConfig {
        projects: vec![project(Vec::new())],
    });
    let pipeline = Pipeline::start(config);

    let exporter = Exporter::start(
        ExporterConfig {
            api_key: CREDENTIAL.to_string(),
            batch_size: 2,
            ..ExporterConfig::default()
        },
        Arc::new(GatewayTransport {
            gateway: Arc::clone(&pipeline.gateway),
            credential: CREDENTIAL.to_string(),
        }),
    );

    let now = chrono::Utc::now().timestamp_millis();
    for path in ["/login", "/cart", "/checkout"] {
        exporter.record(CapturedRequest {
            timestamp_ms: now,
            method: "GET".to_string(),
            path: path.to_string(),
            status_code: 200,
            latency_ms: 12,
            headers: BTreeMap::from([
                ("Authorization".to_string(), "Bearer secret".to_string()),
                ("accept".to_string(), "*/*".to_string()),
            ]),
            query_params: BTreeMap::from([("session_token".to_string(), "abc".to_string())]),
            ip: Some("203.0.113.9".to_string()),
            user_agent: None,
            country_code: None,
        });
    }
    exporter.shutdown().await;

    let stored = pipeline.store.events().await;
    assert_eq!(stored.len(), 3);
    for event in &stored {
        assert_eq!(event.project_id, "shop");
        assert_eq!(event.sanitized_headers["Authorization"], REDACTED);
        assert_eq!(event.sanitized_headers["accept"], "*/*");
        assert_eq!(event.sanitized_query["session_token"], REDACTED);
    }
    assert!(pipeline.finish().await.is_empty());
}
