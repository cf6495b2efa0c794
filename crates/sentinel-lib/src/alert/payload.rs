//! Channel-neutral alert content

use crate::models::{AnomalyEvent, DetectorKind, Severity, WindowSummary};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields every channel carries, in whatever format it renders them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub anomaly_id: Uuid,
    pub project_id: String,
    pub endpoint: String,
    pub detector: DetectorKind,
    pub severity: Severity,
    pub message: String,
    pub summary: WindowSummary,
    /// RFC 3339 detection time
    pub detected_at: String,
}

impl From<&AnomalyEvent> for AlertPayload {
    fn from(event: &AnomalyEvent) -> Self {
        let detected_at = Utc
            .timestamp_millis_opt(event.detected_at_ms)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| event.detected_at_ms.to_string());

        Self {
            anomaly_id: event.id,
            project_id: event.project_id.clone(),
            endpoint: event.endpoint.clone(),
            detector: event.detector,
            severity: event.severity,
            message: event.message(),
            summary: event.summary.clone(),
            detected_at,
        }
    }
}

impl AlertPayload {
    pub fn subject(&self) -> String {
        format!(
            "[{}] {} anomaly on {} ({})",
            self.severity.to_string().to_uppercase(),
            self.detector,
            self.endpoint,
            self.project_id
        )
    }

    /// Plain-text rendering for chat and email
    pub fn text(&self) -> String {
        let s = &self.summary;
        let mut text = format!(
            "{}\nProject: {}\nEndpoint: {}\nDetector: {}\nSeverity: {}\n\
             Window: {} requests, {} errors over {}s\nDetected at: {}",
            self.message,
            self.project_id,
            self.endpoint,
            self.detector,
            self.severity,
            s.request_count,
            s.error_count,
            s.window_secs,
            self.detected_at
        );
        if let Some(country) = &s.country_code {
            text.push_str(&format!("\nCountry: {country}"));
        }
        if let Some(ip) = &s.client_ip {
            text.push_str(&format!("\nIP address: {ip}"));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anomaly() -> AnomalyEvent {
        AnomalyEvent::new(
            "shop",
            "/login",
            DetectorKind::Rate,
            Severity::Medium,
            WindowSummary {
                window_secs: 10,
                request_count: 6,
                error_count: 0,
                observed: 6.0,
                threshold: 5.0,
                percentile_latency_ms: None,
                country_code: None,
                distinct_countries: 0,
                client_ip: None,
            },
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_payload_carries_required_fields() {
        let event = anomaly();
        let payload = AlertPayload::from(&event);

        assert_eq!(payload.anomaly_id, event.id);
        assert_eq!(payload.detected_at, "2023-11-14T22:13:20+00:00");
        assert!(payload.message.starts_with("Rate limit exceeded"));

        let json = serde_json::to_value(&payload).unwrap();
        for field in ["project_id", "endpoint", "detector", "severity", "summary", "detected_at"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["detector"], "rate");
    }

    #[test]
    fn test_text_rendering() {
        let payload = AlertPayload::from(&anomaly());
        assert_eq!(payload.subject(), "[MEDIUM] rate anomaly on /login (shop)");

        let text = payload.text();
        assert!(text.contains("Endpoint: /login"));
        assert!(text.contains("Severity: medium"));
        assert!(text.contains("6 requests, 0 errors over 10s"));
    }
}
