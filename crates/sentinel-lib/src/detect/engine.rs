//! Sharded detection engine and its worker pool
//!
//! State is sharded by (project, endpoint). Events are routed to a worker by
//! a hash of that key, so one shard is only ever mutated by one worker while
//! shards on different workers evaluate in parallel. Per-IP windows span
//! endpoints, so they are shared between workers behind the map's entry
//! lock.

use super::detectors::{Breach, DetectorState, WINDOWED_DETECTORS};
use crate::config::ConfigStore;
use crate::error::DetectorError;
use crate::models::{AnomalyEvent, DetectorKind, RequestEvent, Severity, WindowSummary};
use crate::observability::{PipelineMetrics, StructuredLogger};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardKey {
    pub project_id: String,
    pub endpoint: String,
}

/// Endpoint reported on per-IP anomalies, which cover every endpoint
pub const ALL_ENDPOINTS: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    project_id: String,
    ip: String,
}

#[derive(Debug)]
struct EndpointShard {
    detectors: HashMap<DetectorKind, DetectorState>,
    last_seen_ms: i64,
}

pub struct DetectionEngine {
    config: ConfigStore,
    shards: DashMap<ShardKey, EndpointShard>,
    /// Per-IP rate state, keyed by (project, client address)
    clients: DashMap<ClientKey, DetectorState>,
    /// Endpoints seen per project, for the new-endpoint detector
    known_endpoints: DashMap<String, HashSet<String>>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl DetectionEngine {
    pub fn new(config: ConfigStore, metrics: PipelineMetrics, logger: StructuredLogger) -> Self {
        Self {
            config,
            shards: DashMap::new(),
            clients: DashMap::new(),
            known_endpoints: DashMap::new(),
            metrics,
            logger,
        }
    }

    /// Number of (project, endpoint) shards holding state
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of client addresses with per-IP rate state
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Run every enabled detector for the event's project over the event.
    ///
    /// Detector failures are counted and logged; they never stop the other
    /// detectors or reach the caller.
    pub fn process(&self, event: &RequestEvent) -> Vec<AnomalyEvent> {
        let Some(project) = self.config.project(&event.project_id) else {
            debug!(project_id = %event.project_id, "Dropping event for unknown project");
            return Vec::new();
        };
        if project.is_ignored(event.endpoint()) {
            return Vec::new();
        }
        let settings = &project.detectors;
        let mut anomalies = Vec::new();

        if settings.is_enabled(DetectorKind::NewEndpoint)
            && self.mark_known(&event.project_id, event.endpoint(), settings.max_known_endpoints)
        {
            anomalies.push(AnomalyEvent::new(
                &event.project_id,
                event.endpoint(),
                DetectorKind::NewEndpoint,
                Severity::Low,
                WindowSummary {
                    window_secs: 0,
                    request_count: 1,
                    error_count: u64::from(event.status_code >= settings.error_status_floor),
                    observed: 1.0,
                    threshold: 0.0,
                    percentile_latency_ms: None,
                    country_code: event.country_code.clone(),
                    distinct_countries: usize::from(event.country_code.is_some()),
                    client_ip: None,
                },
                event.timestamp_ms,
            ));
        }

        let key = ShardKey {
            project_id: event.project_id.clone(),
            endpoint: event.endpoint().to_string(),
        };
        {
            let mut shard = self.shards.entry(key).or_insert_with(|| EndpointShard {
                detectors: HashMap::new(),
                last_seen_ms: event.timestamp_ms,
            });
            shard.last_seen_ms = shard.last_seen_ms.max(event.timestamp_ms);

            for kind in WINDOWED_DETECTORS {
                if !settings.is_enabled(*kind) {
                    shard.detectors.remove(kind);
                    continue;
                }
                let state = shard
                    .detectors
                    .entry(*kind)
                    .or_insert_with(|| DetectorState::new(*kind, settings));
                if state.is_stale(settings) {
                    *state = DetectorState::new(*kind, settings);
                }

                let outcome = state.observe(event, settings);
                self.collect(event, *kind, event.endpoint(), outcome, &mut anomalies);
            }
        }

        if settings.is_enabled(DetectorKind::IpRate) {
            if let Some(ip) = event.client_ip.as_deref() {
                let key = ClientKey {
                    project_id: event.project_id.clone(),
                    ip: ip.to_string(),
                };
                let outcome = {
                    let mut state = self
                        .clients
                        .entry(key)
                        .or_insert_with(|| DetectorState::new(DetectorKind::IpRate, settings));
                    if state.is_stale(settings) {
                        *state = DetectorState::new(DetectorKind::IpRate, settings);
                    }
                    state.observe(event, settings)
                };
                self.collect(event, DetectorKind::IpRate, ALL_ENDPOINTS, outcome, &mut anomalies);
            }
        }

        for anomaly in &anomalies {
            self.metrics.inc_anomalies_detected(anomaly.detector.as_str());
            self.logger.log_anomaly(anomaly);
        }
        anomalies
    }

    fn collect(
        &self,
        event: &RequestEvent,
        kind: DetectorKind,
        endpoint: &str,
        outcome: Result<Option<Breach>, DetectorError>,
        anomalies: &mut Vec<AnomalyEvent>,
    ) {
        match outcome {
            Ok(Some(breach)) => anomalies.push(AnomalyEvent::new(
                &event.project_id,
                endpoint,
                kind,
                breach.severity,
                breach.summary,
                event.timestamp_ms,
            )),
            Ok(None) => {}
            Err(e) => {
                self.metrics.inc_detector_errors(kind.as_str());
                warn!(
                    project_id = %event.project_id,
                    endpoint = %event.endpoint(),
                    detector = %kind,
                    error = %e,
                    "Detector evaluation failed"
                );
            }
        }
    }

    /// Returns true the first time an endpoint is seen for a project. Once
    /// the set is full, new endpoints are neither tracked nor reported.
    fn mark_known(&self, project_id: &str, endpoint: &str, max_known: usize) -> bool {
        let mut known = self.known_endpoints.entry(project_id.to_string()).or_default();
        if known.contains(endpoint) || known.len() >= max_known {
            return false;
        }
        known.insert(endpoint.to_string());
        true
    }

    /// Remove shards and per-IP windows idle for longer than their
    /// project's TTL, and all state belonging to projects no longer
    /// configured. Returns the number of entries evicted.
    pub fn evict_idle(&self, now_ms: i64) -> usize {
        let before = self.shards.len() + self.clients.len();
        self.shards.retain(|key, shard| match self.config.project(&key.project_id) {
            Some(project) => now_ms - shard.last_seen_ms < project.detectors.idle_ttl_ms(),
            None => false,
        });
        self.clients.retain(|key, state| match self.config.project(&key.project_id) {
            Some(project) => now_ms - state.last_seen_ms() < project.detectors.idle_ttl_ms(),
            None => false,
        });
        self.known_endpoints
            .retain(|project_id, _| self.config.project(project_id).is_some());

        let after = self.shards.len() + self.clients.len();
        let evicted = before.saturating_sub(after);
        self.metrics.add_windows_evicted(evicted as u64);
        self.metrics.set_windows_active(after as i64);
        if evicted > 0 {
            debug!(evicted, remaining = after, "Evicted idle windows");
        }
        evicted
    }
}

/// Producer side of the engine's worker queues
#[derive(Debug, Clone)]
pub struct EngineHandle {
    senders: Arc<Vec<mpsc::Sender<RequestEvent>>>,
}

/// Queue slots held for a whole batch
pub struct Reservation {
    permits: Vec<mpsc::OwnedPermit<RequestEvent>>,
}

impl Reservation {
    /// Hand events to their workers, in order. `events` must be the slice
    /// the reservation was made for.
    pub fn send(self, events: Vec<RequestEvent>) {
        for (permit, event) in self.permits.into_iter().zip(events) {
            permit.send(event);
        }
    }
}

impl EngineHandle {
    /// Build `workers` bounded queues of `capacity` events each
    pub fn channel(workers: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<RequestEvent>>) {
        let (senders, receivers) = (0..workers.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip::<_, _, Vec<_>, Vec<_>>();
        (
            Self {
                senders: Arc::new(senders),
            },
            receivers,
        )
    }

    fn route(&self, event: &RequestEvent) -> &mpsc::Sender<RequestEvent> {
        let mut hasher = DefaultHasher::new();
        event.project_id.hash(&mut hasher);
        event.endpoint().hash(&mut hasher);
        let idx = (hasher.finish() % self.senders.len() as u64) as usize;
        &self.senders[idx]
    }

    /// Reserve a queue slot for every event, or none at all if any target
    /// queue is full or closed
    pub fn reserve(&self, events: &[RequestEvent]) -> Option<Reservation> {
        let mut permits = Vec::with_capacity(events.len());
        for event in events {
            match self.route(event).clone().try_reserve_owned() {
                Ok(permit) => permits.push(permit),
                // Dropping the collected permits releases their slots
                Err(_) => return None,
            }
        }
        Some(Reservation { permits })
    }

    /// Events waiting across all worker queues
    pub fn pending(&self) -> usize {
        self.senders
            .iter()
            .map(|s| s.max_capacity() - s.capacity())
            .sum()
    }
}

/// Start one task per receiver. Each drains its queue until every sender
/// is dropped, forwarding anomalies to the dispatcher queue.
pub fn spawn_workers(
    engine: Arc<DetectionEngine>,
    receivers: Vec<mpsc::Receiver<RequestEvent>>,
    anomaly_tx: mpsc::Sender<AnomalyEvent>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(worker, mut rx)| {
            let engine = Arc::clone(&engine);
            let anomaly_tx = anomaly_tx.clone();
            tokio::spawn(async move {
                debug!(worker, "Detection worker started");
                while let Some(event) = rx.recv().await {
                    for anomaly in engine.process(&event) {
                        if anomaly_tx.send(anomaly).await.is_err() {
                            warn!(worker, "Anomaly queue closed, dropping anomaly");
                        }
                    }
                }
                info!(worker, "Detection worker stopped");
            })
        })
        .collect()
}
