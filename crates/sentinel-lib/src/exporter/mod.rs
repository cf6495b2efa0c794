//! In-process telemetry exporter
//!
//! Runs inside the monitored service. `record` sanitizes a captured request
//! and appends it to a bounded queue; a background worker flushes batches to
//! the collector on a size or time trigger and requeues them on failure.
//! Nothing here ever returns an error to the host's request path.

mod middleware;
mod queue;
mod sanitize;
mod transport;
mod worker;

pub use middleware::{SentinelLayer, SentinelService};
pub use queue::{EventQueue, QueueStats, DEFAULT_MAX_QUEUE_LEN};
pub use sanitize::{Sanitizer, REDACTED};
pub use transport::{BatchTransport, HttpTransport};

use crate::backoff::millis;
use crate::config::{DEFAULT_SENSITIVE_HEADERS, DEFAULT_SENSITIVE_PARAMS};
use crate::error::TransportError;
use crate::models::CapturedRequest;
use crate::observability::PipelineMetrics;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use worker::{FlushWorker, Shared};

/// Exporter settings. Durations are given in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub api_key: String,
    pub collector_url: String,
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub batch_interval: Duration,
    pub max_queue_len: usize,
    /// Path prefixes never recorded
    pub ignore_paths: Vec<String>,
    pub sensitive_headers: Vec<String>,
    pub sensitive_params: Vec<String>,
    /// Edge header carrying the client's country code
    pub country_header: String,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            collector_url: "http://localhost:8080".to_string(),
            batch_size: 10,
            batch_interval: Duration::from_secs(3),
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            ignore_paths: Vec::new(),
            sensitive_headers: DEFAULT_SENSITIVE_HEADERS.iter().map(|s| s.to_string()).collect(),
            sensitive_params: DEFAULT_SENSITIVE_PARAMS.iter().map(|s| s.to_string()).collect(),
            country_header: "cf-ipcountry".to_string(),
            request_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Cloneable handle to a running exporter
#[derive(Clone)]
pub struct Exporter {
    shared: Arc<Shared>,
    sanitizer: Arc<Sanitizer>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("collector_url", &self.shared.config.collector_url)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Exporter {
    /// Start the flush worker on the current tokio runtime
    pub fn start(mut config: ExporterConfig, transport: Arc<dyn BatchTransport>) -> Self {
        config.batch_size = config.batch_size.max(1);
        let sanitizer = Sanitizer::new(
            config.sensitive_headers.as_slice(),
            config.sensitive_params.as_slice(),
        );
        let shared = Arc::new(Shared {
            queue: Mutex::new(EventQueue::new(config.max_queue_len)),
            notify: Notify::new(),
            metrics: PipelineMetrics::new(),
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = FlushWorker::new(Arc::clone(&shared), transport);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        Self {
            shared,
            sanitizer: Arc::new(sanitizer),
            shutdown_tx: Arc::new(shutdown_tx),
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Start with an [`HttpTransport`] built from the config
    pub fn with_http(config: ExporterConfig) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(
            &config.collector_url,
            config.api_key.clone(),
            config.request_timeout,
        )?;
        Ok(Self::start(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.shared.config
    }

    /// Queue one completed request. Never blocks on I/O and never fails.
    pub fn record(&self, mut request: CapturedRequest) {
        let config = &self.shared.config;
        if config
            .ignore_paths
            .iter()
            .any(|prefix| request.path.starts_with(prefix.as_str()))
        {
            return;
        }

        self.sanitizer.sanitize_headers(&mut request.headers);
        self.sanitizer.sanitize_query(&mut request.query_params);

        let (len, evicted) = {
            let mut queue = self.shared.lock();
            let evicted = queue.push(request);
            (queue.len(), evicted)
        };

        if evicted > 0 {
            self.shared
                .metrics
                .add_exporter_events_dropped(evicted as u64);
            debug!(evicted, "Exporter queue full, dropped oldest events");
        }
        self.shared.metrics.set_exporter_queue_depth(len as i64);

        // First entry arms the interval timer, a full batch flushes now
        if len == 1 || len >= config.batch_size {
            self.shared.notify.notify_one();
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats()
    }

    /// Flush what is still queued (best effort) and stop the worker
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Exporter flush worker ended abnormally");
            }
        }
    }
}
