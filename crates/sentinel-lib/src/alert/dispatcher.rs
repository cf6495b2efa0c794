//! Alert dispatcher: dedup, per-channel cooldown, fan-out and retry
//!
//! Each anomaly is resolved to the project's channels and delivered by one
//! task per channel, so a slow or failing channel never holds up another.
//! Every try is recorded in the [`DeliveryLog`]; exhausted deliveries are
//! counted and logged at error level.

use super::channels::ChannelAdapter;
use super::payload::AlertPayload;
use crate::backoff::RetryPolicy;
use crate::config::ConfigStore;
use crate::health::{components, HealthRegistry};
use crate::models::{
    AlertChannel, AnomalyEvent, ChannelKind, DeliveryAttempt, DeliveryOutcome, DetectorKind,
};
use crate::observability::{PipelineMetrics, StructuredLogger};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default width of the dedup time bucket
pub const DEFAULT_DEDUP_BUCKET_SECS: u64 = 60;

/// Default number of attempts kept in the delivery log
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bounded in-memory history of delivery attempts, oldest evicted first
#[derive(Debug, Clone)]
pub struct DeliveryLog {
    entries: Arc<Mutex<VecDeque<DeliveryAttempt>>>,
    capacity: usize,
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, attempt: DeliveryAttempt) {
        let mut entries = lock(&self.entries);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(attempt);
    }

    /// Attempts for one anomaly, in the order they were made
    pub fn attempts_for(&self, anomaly_id: Uuid) -> Vec<DeliveryAttempt> {
        lock(&self.entries)
            .iter()
            .filter(|a| a.anomaly_event_id == anomaly_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<DeliveryAttempt> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    project_id: String,
    endpoint: String,
    detector: DetectorKind,
    client_ip: Option<String>,
    bucket: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    project_id: String,
    channel_id: String,
    endpoint: String,
    detector: DetectorKind,
    client_ip: Option<String>,
}

/// What happened to one anomaly
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// The anomaly was already dispatched in this dedup bucket
    pub duplicate: bool,
    /// Channels skipped because of their cooldown
    pub suppressed: Vec<String>,
    pub delivered: Vec<String>,
    pub exhausted: Vec<String>,
}

pub struct AlertDispatcher {
    config: ConfigStore,
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
    retry: RetryPolicy,
    dedup_bucket_ms: i64,
    /// Dedup key -> time the bucket was first dispatched
    dedup: Mutex<HashMap<DedupKey, i64>>,
    /// Cooldown key -> end of the cooldown
    cooldowns: Mutex<HashMap<CooldownKey, i64>>,
    log: DeliveryLog,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl AlertDispatcher {
    pub fn new(
        config: ConfigStore,
        retry: RetryPolicy,
        metrics: PipelineMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            config,
            adapters: HashMap::new(),
            retry,
            dedup_bucket_ms: DEFAULT_DEDUP_BUCKET_SECS as i64 * 1000,
            dedup: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            log: DeliveryLog::default(),
            metrics,
            logger,
            health: None,
        }
    }

    /// Report exhausted deliveries as a degraded dispatcher
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Register the adapter used for its channel kind
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn with_dedup_bucket_secs(mut self, secs: u64) -> Self {
        self.dedup_bucket_ms = secs.max(1) as i64 * 1000;
        self
    }

    pub fn with_delivery_log(mut self, log: DeliveryLog) -> Self {
        self.log = log;
        self
    }

    pub fn delivery_log(&self) -> &DeliveryLog {
        &self.log
    }

    /// True the first time this (project, endpoint, detector, bucket) is seen
    fn first_in_bucket(&self, event: &AnomalyEvent) -> bool {
        let key = DedupKey {
            project_id: event.project_id.clone(),
            endpoint: event.endpoint.clone(),
            detector: event.detector,
            client_ip: event.summary.client_ip.clone(),
            bucket: event.detected_at_ms.div_euclid(self.dedup_bucket_ms),
        };
        let mut dedup = lock(&self.dedup);
        if dedup.contains_key(&key) {
            return false;
        }
        dedup.insert(key, event.detected_at_ms);
        true
    }

    /// Atomically check the channel's cooldown and, if clear, start a new one
    fn claim_channel(&self, channel: &AlertChannel, event: &AnomalyEvent) -> bool {
        let key = CooldownKey {
            project_id: event.project_id.clone(),
            channel_id: channel.id.clone(),
            endpoint: event.endpoint.clone(),
            detector: event.detector,
            client_ip: event.summary.client_ip.clone(),
        };
        let now = event.detected_at_ms;
        let mut cooldowns = lock(&self.cooldowns);
        if cooldowns.get(&key).is_some_and(|until| now < *until) {
            return false;
        }
        cooldowns.insert(key, now.saturating_add(channel.cooldown_secs as i64 * 1000));
        true
    }

    /// Deliver one anomaly to every eligible channel of its project and wait
    /// for all deliveries to finish
    pub async fn dispatch(&self, event: &AnomalyEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        if !self.first_in_bucket(event) {
            self.metrics.inc_alerts_suppressed("duplicate");
            debug!(anomaly_id = %event.id, "Duplicate anomaly suppressed");
            report.duplicate = true;
            return report;
        }

        let Some(project) = self.config.project(&event.project_id) else {
            debug!(project_id = %event.project_id, "No configuration for anomaly's project");
            return report;
        };

        let payload = Arc::new(AlertPayload::from(event));
        let mut deliveries = JoinSet::new();

        for channel in project.alert_channels() {
            // An unusable channel must not start a cooldown
            let Some(adapter) = self.adapters.get(&channel.kind).cloned() else {
                warn!(channel_id = %channel.id, kind = %channel.kind, "No adapter for channel kind");
                continue;
            };
            if !self.claim_channel(&channel, event) {
                self.metrics.inc_alerts_suppressed("cooldown");
                report.suppressed.push(channel.id);
                continue;
            }

            let job = Delivery {
                channel,
                adapter,
                payload: Arc::clone(&payload),
                event: event.clone(),
                retry: self.retry,
                log: self.log.clone(),
                metrics: self.metrics.clone(),
                logger: self.logger.clone(),
            };
            deliveries.spawn(job.run());
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((channel_id, true)) => report.delivered.push(channel_id),
                Ok((channel_id, false)) => report.exhausted.push(channel_id),
                Err(e) => warn!(error = %e, "Delivery task failed"),
            }
        }
        report.delivered.sort();
        report.exhausted.sort();
        self.report_health(&report).await;
        report
    }

    async fn report_health(&self, report: &DispatchReport) {
        let Some(health) = &self.health else {
            return;
        };
        if !report.exhausted.is_empty() {
            let message = format!("deliveries exhausted on {}", report.exhausted.join(", "));
            health.set_degraded(components::DISPATCHER, message).await;
        } else if !report.delivered.is_empty() {
            health.set_healthy(components::DISPATCHER).await;
        }
    }

    /// Drop dedup and cooldown entries that can no longer match
    pub fn prune(&self, now_ms: i64) {
        let horizon = now_ms - self.dedup_bucket_ms * 2;
        lock(&self.dedup).retain(|_, seen| *seen > horizon);
        lock(&self.cooldowns).retain(|_, until| *until > now_ms);
    }

    /// Consume anomalies until the queue closes, then wait for deliveries
    /// still in flight
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<AnomalyEvent>) {
        info!("Alert dispatcher started");
        let mut in_flight = JoinSet::new();

        while let Some(event) = rx.recv().await {
            let dispatcher = Arc::clone(&self);
            in_flight.spawn(async move { dispatcher.dispatch(&event).await });
            // Reap finished dispatches so the set stays small
            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    warn!(error = %e, "Dispatch task failed");
                }
            }
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(pending, "Anomaly queue closed, waiting for in-flight deliveries");
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "Dispatch task failed");
            }
        }
        info!("Alert dispatcher stopped");
    }
}

/// One channel delivery with its retry loop
struct Delivery {
    channel: AlertChannel,
    adapter: Arc<dyn ChannelAdapter>,
    payload: Arc<AlertPayload>,
    event: AnomalyEvent,
    retry: RetryPolicy,
    log: DeliveryLog,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl Delivery {
    fn record(&self, attempt_number: u32, outcome: DeliveryOutcome) {
        let label = match &outcome {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Failed { .. } => "failed",
            DeliveryOutcome::Exhausted { .. } => "exhausted",
        };
        self.metrics
            .inc_delivery_attempts(&self.channel.kind.to_string(), label);
        self.log.record(DeliveryAttempt {
            alert_channel_id: self.channel.id.clone(),
            anomaly_event_id: self.event.id,
            attempt_number,
            outcome,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        });
    }

    /// Returns the channel id and whether the delivery succeeded
    async fn run(self) -> (String, bool) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.adapter.send(&self.channel.target, &self.payload).await {
                Ok(()) => {
                    self.record(attempt, DeliveryOutcome::Delivered);
                    debug!(
                        channel_id = %self.channel.id,
                        anomaly_id = %self.event.id,
                        attempt,
                        "Alert delivered"
                    );
                    return (self.channel.id.clone(), true);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    self.record(
                        attempt,
                        DeliveryOutcome::Failed {
                            error: e.to_string(),
                        },
                    );
                    let delay = backoff.next_delay();
                    debug!(
                        channel_id = %self.channel.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Alert delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let error = e.to_string();
                    self.record(
                        attempt,
                        DeliveryOutcome::Exhausted {
                            error: error.clone(),
                        },
                    );
                    self.metrics
                        .inc_deliveries_exhausted(&self.channel.kind.to_string());
                    self.logger
                        .log_delivery_exhausted(&self.channel.id, &self.event, attempt, &error);
                    return (self.channel.id.clone(), false);
                }
            }
        }
    }
}
