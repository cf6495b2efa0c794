//! Core data models for the telemetry pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A request as captured by the exporter and sent over the wire.
///
/// The project is not part of the payload: the gateway stamps it from the
/// credential the batch arrived with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    /// Completion time (Unix milliseconds)
    pub timestamp_ms: i64,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
}

/// A sanitized request event accepted by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub project_id: String,
    pub timestamp_ms: i64,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub sanitized_headers: BTreeMap<String, String>,
    pub sanitized_query: BTreeMap<String, String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub country_code: Option<String>,
}

impl RequestEvent {
    /// Bind a captured request to the project that sent it
    pub fn from_captured(project_id: impl Into<String>, captured: CapturedRequest) -> Self {
        Self {
            project_id: project_id.into(),
            timestamp_ms: captured.timestamp_ms,
            method: captured.method,
            path: captured.path,
            status_code: captured.status_code,
            latency_ms: captured.latency_ms,
            sanitized_headers: captured.headers,
            sanitized_query: captured.query_params,
            client_ip: captured.ip,
            user_agent: captured.user_agent,
            country_code: captured.country_code.map(|c| c.to_ascii_uppercase()),
        }
    }

    /// Endpoint this request is accounted under
    pub fn endpoint(&self) -> &str {
        &self.path
    }
}

/// A monitored project as known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Hex-encoded SHA-256 of the project's API key
    pub key_hash: String,
}

/// Detector kinds evaluated by the detection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Rate,
    ErrorRate,
    Geo,
    Latency,
    NewEndpoint,
    /// Requests from one client IP across all of a project's endpoints
    IpRate,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Rate => "rate",
            DetectorKind::ErrorRate => "error_rate",
            DetectorKind::Geo => "geo",
            DetectorKind::Latency => "latency",
            DetectorKind::NewEndpoint => "new_endpoint",
            DetectorKind::IpRate => "ip_rate",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot of the window that triggered a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    /// Window length in seconds (0 for detectors that do not window)
    pub window_secs: u64,
    pub request_count: u64,
    pub error_count: u64,
    /// Value the detector compared against its threshold
    pub observed: f64,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    pub distinct_countries: usize,
    /// Set by the per-IP rate detector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

/// An anomaly produced by a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub project_id: String,
    pub endpoint: String,
    pub detector: DetectorKind,
    pub severity: Severity,
    pub summary: WindowSummary,
    /// Detection time (Unix milliseconds, taken from the triggering event)
    pub detected_at_ms: i64,
}

impl AnomalyEvent {
    pub fn new(
        project_id: impl Into<String>,
        endpoint: impl Into<String>,
        detector: DetectorKind,
        severity: Severity,
        summary: WindowSummary,
        detected_at_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            endpoint: endpoint.into(),
            detector,
            severity,
            summary,
            detected_at_ms,
        }
    }

    /// Human-readable description used by text channels and logs
    pub fn message(&self) -> String {
        let s = &self.summary;
        match self.detector {
            DetectorKind::Rate => format!(
                "Rate limit exceeded: {} requests to {} in {}s (threshold {})",
                s.request_count, self.endpoint, s.window_secs, s.threshold
            ),
            DetectorKind::ErrorRate => format!(
                "Error spike detected: {}/{} requests to {} failed ({:.0}% > {:.0}%)",
                s.error_count,
                s.request_count,
                self.endpoint,
                s.observed * 100.0,
                s.threshold * 100.0
            ),
            DetectorKind::Geo => format!(
                "Access from suspicious location {} on {}",
                s.country_code.as_deref().unwrap_or("??"),
                self.endpoint
            ),
            DetectorKind::Latency => format!(
                "Latency degradation on {}: percentile latency {}ms exceeds {}ms",
                self.endpoint,
                s.percentile_latency_ms.unwrap_or(s.observed as u64),
                s.threshold
            ),
            DetectorKind::NewEndpoint => format!("New endpoint detected: {}", self.endpoint),
            DetectorKind::IpRate => format!(
                "Rate limit exceeded: {} requests in {}s from IP {} (threshold {})",
                s.request_count,
                s.window_secs,
                s.client_ip.as_deref().unwrap_or("unknown"),
                s.threshold
            ),
        }
    }
}

/// Alert channel kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Slack,
    Webhook,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Slack => write!(f, "slack"),
            ChannelKind::Webhook => write!(f, "webhook"),
        }
    }
}

/// A configured notification target for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertChannel {
    pub id: String,
    pub project_id: String,
    pub kind: ChannelKind,
    pub target: String,
    pub cooldown_secs: u64,
}

/// Outcome of one delivery try
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed, another attempt follows
    Failed { error: String },
    /// Failed and no attempts remain
    Exhausted { error: String },
}

impl DeliveryOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryOutcome::Failed { .. })
    }
}

/// Record of a single delivery try to a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub alert_channel_id: String,
    pub anomaly_event_id: Uuid,
    pub attempt_number: u32,
    pub outcome: DeliveryOutcome,
    pub timestamp_ms: i64,
}
