//! Observability infrastructure for the pipeline
//!
//! Provides:
//! - Prometheus metrics for ingestion, detection, dispatch and the exporter
//! - Structured JSON logging of significant pipeline events with tracing

use crate::models::{AnomalyEvent, Severity};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for ingestion latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    events_ingested: IntCounter,
    events_skipped: IntCounter,
    batches_rejected: IntCounterVec,
    ingest_latency_seconds: Histogram,
    windows_active: IntGauge,
    windows_evicted: IntCounter,
    anomalies_detected: IntCounterVec,
    detector_errors: IntCounterVec,
    alerts_suppressed: IntCounterVec,
    delivery_attempts: IntCounterVec,
    deliveries_exhausted: IntCounterVec,
    exporter_batches_sent: IntCounter,
    exporter_events_dropped: IntCounter,
    exporter_queue_depth: IntGauge,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            events_ingested: register_int_counter!(
                "sentinel_events_ingested_total",
                "Request events accepted and persisted by the gateway"
            )
            .expect("Failed to register events_ingested"),

            events_skipped: register_int_counter!(
                "sentinel_events_skipped_total",
                "Malformed request events dropped by the gateway"
            )
            .expect("Failed to register events_skipped"),

            batches_rejected: register_int_counter_vec!(
                "sentinel_batches_rejected_total",
                "Batches rejected by the gateway",
                &["reason"]
            )
            .expect("Failed to register batches_rejected"),

            ingest_latency_seconds: register_histogram!(
                "sentinel_ingest_latency_seconds",
                "Time spent authenticating, validating and persisting a batch",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register ingest_latency_seconds"),

            windows_active: register_int_gauge!(
                "sentinel_windows_active",
                "Endpoint shards currently holding window state"
            )
            .expect("Failed to register windows_active"),

            windows_evicted: register_int_counter!(
                "sentinel_windows_evicted_total",
                "Endpoint shards evicted after idling past their TTL"
            )
            .expect("Failed to register windows_evicted"),

            anomalies_detected: register_int_counter_vec!(
                "sentinel_anomalies_detected_total",
                "Anomaly events emitted by the detection engine",
                &["detector"]
            )
            .expect("Failed to register anomalies_detected"),

            detector_errors: register_int_counter_vec!(
                "sentinel_detector_errors_total",
                "Detector evaluations that failed",
                &["detector"]
            )
            .expect("Failed to register detector_errors"),

            alerts_suppressed: register_int_counter_vec!(
                "sentinel_alerts_suppressed_total",
                "Notifications suppressed by deduplication or channel cooldown",
                &["reason"]
            )
            .expect("Failed to register alerts_suppressed"),

            delivery_attempts: register_int_counter_vec!(
                "sentinel_delivery_attempts_total",
                "Alert delivery attempts by channel kind and outcome",
                &["channel", "outcome"]
            )
            .expect("Failed to register delivery_attempts"),

            deliveries_exhausted: register_int_counter_vec!(
                "sentinel_deliveries_exhausted_total",
                "Alert deliveries that ran out of retry attempts",
                &["channel"]
            )
            .expect("Failed to register deliveries_exhausted"),

            exporter_batches_sent: register_int_counter!(
                "sentinel_exporter_batches_sent_total",
                "Batches delivered by the exporter"
            )
            .expect("Failed to register exporter_batches_sent"),

            exporter_events_dropped: register_int_counter!(
                "sentinel_exporter_events_dropped_total",
                "Events dropped by the exporter (queue cap or rejected batch)"
            )
            .expect("Failed to register exporter_events_dropped"),

            exporter_queue_depth: register_int_gauge!(
                "sentinel_exporter_queue_depth",
                "Events waiting in the exporter queue"
            )
            .expect("Failed to register exporter_queue_depth"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PipelineMetrics")
    }
}

impl PipelineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn add_events_ingested(&self, count: u64) {
        self.inner().events_ingested.inc_by(count);
    }

    pub fn add_events_skipped(&self, count: u64) {
        self.inner().events_skipped.inc_by(count);
    }

    pub fn inc_batches_rejected(&self, reason: &str) {
        self.inner()
            .batches_rejected
            .with_label_values(&[reason])
            .inc();
    }

    pub fn observe_ingest_latency(&self, duration_secs: f64) {
        self.inner().ingest_latency_seconds.observe(duration_secs);
    }

    pub fn set_windows_active(&self, count: i64) {
        self.inner().windows_active.set(count);
    }

    pub fn add_windows_evicted(&self, count: u64) {
        self.inner().windows_evicted.inc_by(count);
    }

    pub fn inc_anomalies_detected(&self, detector: &str) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[detector])
            .inc();
    }

    pub fn inc_detector_errors(&self, detector: &str) {
        self.inner()
            .detector_errors
            .with_label_values(&[detector])
            .inc();
    }

    pub fn inc_alerts_suppressed(&self, reason: &str) {
        self.inner()
            .alerts_suppressed
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_delivery_attempts(&self, channel: &str, outcome: &str) {
        self.inner()
            .delivery_attempts
            .with_label_values(&[channel, outcome])
            .inc();
    }

    pub fn inc_deliveries_exhausted(&self, channel: &str) {
        self.inner()
            .deliveries_exhausted
            .with_label_values(&[channel])
            .inc();
    }

    pub fn inc_exporter_batches_sent(&self) {
        self.inner().exporter_batches_sent.inc();
    }

    pub fn add_exporter_events_dropped(&self, count: u64) {
        self.inner().exporter_events_dropped.inc_by(count);
    }

    pub fn set_exporter_queue_depth(&self, depth: i64) {
        self.inner().exporter_queue_depth.set(depth);
    }
}

/// Structured logger for pipeline events
///
/// Provides consistent JSON-formatted logging for anomalies, rejected
/// batches, exhausted deliveries and lifecycle events.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log an anomaly emitted by the detection engine
    pub fn log_anomaly(&self, anomaly: &AnomalyEvent) {
        let message = anomaly.message();
        if anomaly.severity >= Severity::High {
            warn!(
                event = "anomaly_detected",
                instance = %self.instance,
                anomaly_id = %anomaly.id,
                project_id = %anomaly.project_id,
                endpoint = %anomaly.endpoint,
                detector = %anomaly.detector,
                severity = %anomaly.severity,
                details = %message,
                "High severity anomaly detected"
            );
        } else {
            info!(
                event = "anomaly_detected",
                instance = %self.instance,
                anomaly_id = %anomaly.id,
                project_id = %anomaly.project_id,
                endpoint = %anomaly.endpoint,
                detector = %anomaly.detector,
                severity = %anomaly.severity,
                details = %message,
                "Anomaly detected"
            );
        }
    }

    /// Log a batch the gateway refused
    pub fn log_batch_rejected(&self, project_id: Option<&str>, reason: &str, events: usize) {
        warn!(
            event = "batch_rejected",
            instance = %self.instance,
            project_id = project_id.unwrap_or("-"),
            reason = %reason,
            events = events,
            "Rejected telemetry batch"
        );
    }

    /// Log a delivery that ran out of attempts
    pub fn log_delivery_exhausted(
        &self,
        channel_id: &str,
        anomaly: &AnomalyEvent,
        attempts: u32,
        last_error: &str,
    ) {
        error!(
            event = "delivery_exhausted",
            instance = %self.instance,
            channel_id = %channel_id,
            anomaly_id = %anomaly.id,
            project_id = %anomaly.project_id,
            endpoint = %anomaly.endpoint,
            detector = %anomaly.detector,
            attempts = attempts,
            error = %last_error,
            "Alert delivery exhausted all attempts"
        );
    }

    /// Log work left behind when a shutdown grace period expires
    pub fn log_abandoned(&self, component: &str, pending: usize) {
        warn!(
            event = "work_abandoned",
            instance = %self.instance,
            component = %component,
            pending = pending,
            "Shutdown grace period expired, abandoning in-flight work"
        );
    }

    pub fn log_startup(&self, version: &str, projects: usize) {
        info!(
            event = "collector_started",
            instance = %self.instance,
            version = %version,
            projects = projects,
            "Sentinel collector started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "collector_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Sentinel collector shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics_handles_share_registry() {
        let metrics = PipelineMetrics::new();
        let other = metrics.clone();

        metrics.add_events_ingested(3);
        other.inc_batches_rejected("unauthorized");
        metrics.inc_anomalies_detected("rate");
        metrics.inc_delivery_attempts("webhook", "delivered");
        metrics.observe_ingest_latency(0.002);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "sentinel_events_ingested_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("collector-1");
        assert_eq!(logger.instance, "collector-1");
    }
}
