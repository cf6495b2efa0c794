//! Ingestion gateway: authenticate, validate, persist, forward

use super::registry::ProjectRegistry;
use super::store::EventStore;
use super::validate::{validate_event, ValidationLimits};
use crate::config::ConfigStore;
use crate::detect::EngineHandle;
use crate::error::IngestError;
use crate::exporter::Sanitizer;
use crate::health::{components, HealthRegistry};
use crate::models::RequestEvent;
use crate::observability::{PipelineMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Seconds an exporter is told to wait when the pipeline is saturated
pub const RETRY_AFTER_SECS: u64 = 1;

/// Result of an accepted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub accepted: usize,
    pub skipped: usize,
}

pub struct IngestGateway {
    registry: Arc<dyn ProjectRegistry>,
    store: Arc<dyn EventStore>,
    config: ConfigStore,
    /// Taken on shutdown so the engine queues close once in-flight batches
    /// finish
    engine: Mutex<Option<EngineHandle>>,
    limits: ValidationLimits,
    accepting: AtomicBool,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl IngestGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn ProjectRegistry>,
        store: Arc<dyn EventStore>,
        config: ConfigStore,
        engine: EngineHandle,
        limits: ValidationLimits,
        metrics: PipelineMetrics,
        logger: StructuredLogger,
        health: HealthRegistry,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            engine: Mutex::new(Some(engine)),
            limits,
            accepting: AtomicBool::new(true),
            metrics,
            logger,
            health,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new batches and release the engine queues
    pub fn stop_accepting(&self) -> Option<EngineHandle> {
        self.accepting.store(false, Ordering::SeqCst);
        self.engine.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn engine(&self) -> Option<EngineHandle> {
        self.engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reject(&self, project_id: Option<&str>, reason: &str, events: usize) {
        self.metrics.inc_batches_rejected(reason);
        self.logger.log_batch_rejected(project_id, reason, events);
    }

    /// Ingest one batch sent with `credential`.
    ///
    /// The batch is accepted once its events are persisted and queued for
    /// detection; malformed events are skipped and counted.
    pub async fn ingest(
        &self,
        credential: &str,
        batch: Vec<Value>,
    ) -> Result<IngestReceipt, IngestError> {
        let started = Instant::now();
        let total = batch.len();

        let Some(project) = self.registry.lookup(credential).await else {
            self.reject(None, "unauthorized", total);
            return Err(IngestError::Unauthorized);
        };
        if !self.is_accepting() {
            self.reject(Some(&project.id), "draining", total);
            return Err(IngestError::RateLimited {
                retry_after_secs: RETRY_AFTER_SECS,
            });
        }
        if batch.is_empty() {
            self.reject(Some(&project.id), "empty", 0);
            return Err(IngestError::Malformed("batch is empty".to_string()));
        }
        if total > self.limits.max_batch_events {
            self.reject(Some(&project.id), "too_large", total);
            return Err(IngestError::Malformed(format!(
                "batch of {total} events exceeds limit of {}",
                self.limits.max_batch_events
            )));
        }

        // The project's own lists apply even if the exporter was misconfigured
        let sanitizer = match self.config.project(&project.id) {
            Some(p) => Sanitizer::new(
                p.sensitive_headers.as_slice(),
                p.sensitive_params.as_slice(),
            ),
            None => Sanitizer::default(),
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut events = Vec::with_capacity(total);
        let mut skipped = 0;
        for (index, value) in batch.into_iter().enumerate() {
            match validate_event(value, &self.limits, now_ms) {
                Ok(captured) => {
                    let mut event = RequestEvent::from_captured(&project.id, captured);
                    sanitizer.sanitize_headers(&mut event.sanitized_headers);
                    sanitizer.sanitize_query(&mut event.sanitized_query);
                    events.push(event);
                }
                Err(reason) => {
                    skipped += 1;
                    debug!(
                        project_id = %project.id,
                        index,
                        reason = %reason,
                        "Skipping malformed event"
                    );
                }
            }
        }
        self.metrics.add_events_skipped(skipped as u64);

        if events.is_empty() {
            self.metrics.observe_ingest_latency(started.elapsed().as_secs_f64());
            return Ok(IngestReceipt {
                accepted: 0,
                skipped,
            });
        }

        // Claim engine capacity before persisting so a saturated pipeline
        // sheds the batch without writing it
        let reservation = self.engine().and_then(|engine| engine.reserve(&events));
        let Some(reservation) = reservation else {
            self.reject(Some(&project.id), "backpressure", total);
            self.health
                .set_degraded(components::GATEWAY, "engine queues full, shedding batches")
                .await;
            return Err(IngestError::RateLimited {
                retry_after_secs: RETRY_AFTER_SECS,
            });
        };

        if let Err(e) = self.store.append(&events).await {
            self.reject(Some(&project.id), "store_failure", total);
            self.health
                .set_degraded(components::EVENT_STORE, e.to_string())
                .await;
            return Err(IngestError::Unavailable(e.to_string()));
        }
        self.health.set_healthy(components::EVENT_STORE).await;

        let accepted = events.len();
        reservation.send(events);
        self.health.set_healthy(components::GATEWAY).await;

        self.metrics.add_events_ingested(accepted as u64);
        self.metrics.observe_ingest_latency(started.elapsed().as_secs_f64());
        debug!(project_id = %project.id, accepted, skipped, "Batch ingested");

        Ok(IngestReceipt { accepted, skipped })
    }
}
