//! Per-event shape and size validation
//!
//! Every event in a batch is checked on its own. A failure here skips that
//! event; it never rejects the rest of the batch.

use crate::models::CapturedRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Size bounds applied to incoming events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub max_batch_events: usize,
    pub max_method_len: usize,
    pub max_path_len: usize,
    /// Serialized JSON size of the header map
    pub max_headers_bytes: usize,
    /// Serialized JSON size of the query map
    pub max_query_bytes: usize,
    pub max_user_agent_len: usize,
    /// How far an event timestamp may sit from ingest time, either way
    pub max_clock_skew_secs: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_batch_events: 1_000,
            max_method_len: 16,
            max_path_len: 2_048,
            max_headers_bytes: 8 * 1_024,
            max_query_bytes: 4 * 1_024,
            max_user_agent_len: 512,
            max_clock_skew_secs: 300,
        }
    }
}

fn map_size(map: &BTreeMap<String, String>) -> usize {
    serde_json::to_vec(map).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Decode one event and check it against `limits`. `now_ms` is the ingest
/// time the event timestamp is compared with.
pub fn validate_event(
    value: Value,
    limits: &ValidationLimits,
    now_ms: i64,
) -> Result<CapturedRequest, String> {
    let event: CapturedRequest =
        serde_json::from_value(value).map_err(|e| format!("invalid event shape: {e}"))?;

    if event.method.is_empty() || event.method.len() > limits.max_method_len {
        return Err(format!("method length {} out of bounds", event.method.len()));
    }
    if !event.method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err("method must be ASCII letters".to_string());
    }
    if !event.path.starts_with('/') {
        return Err("path must start with '/'".to_string());
    }
    if event.path.len() > limits.max_path_len {
        return Err(format!("path exceeds {} bytes", limits.max_path_len));
    }
    if !(100..=599).contains(&event.status_code) {
        return Err(format!("status code {} out of range", event.status_code));
    }
    if event.timestamp_ms <= 0 {
        return Err("timestamp must be positive".to_string());
    }
    if event.timestamp_ms.abs_diff(now_ms) > limits.max_clock_skew_secs.saturating_mul(1_000) {
        return Err(format!(
            "timestamp {} is more than {}s from ingest time",
            event.timestamp_ms, limits.max_clock_skew_secs
        ));
    }
    if map_size(&event.headers) > limits.max_headers_bytes {
        return Err(format!("headers exceed {} bytes", limits.max_headers_bytes));
    }
    if map_size(&event.query_params) > limits.max_query_bytes {
        return Err(format!("query exceeds {} bytes", limits.max_query_bytes));
    }
    if let Some(ua) = &event.user_agent {
        if ua.len() > limits.max_user_agent_len {
            return Err(format!("user agent exceeds {} bytes", limits.max_user_agent_len));
        }
    }
    if let Some(country) = &event.country_code {
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid country code {country:?}"));
        }
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn valid() -> Value {
        json!({
            "timestamp_ms": NOW - 250,
            "method": "GET",
            "path": "/orders",
            "status_code": 200,
            "latency_ms": 12,
            "headers": {"accept": "application/json"},
            "query_params": {"page": "1"},
            "ip": "203.0.113.9",
            "user_agent": "curl/8.0",
            "country_code": "us"
        })
    }

    fn with(field: &str, value: Value) -> Value {
        let mut event = valid();
        event[field] = value;
        event
    }

    #[test]
    fn test_accepts_valid_event() {
        let limits = ValidationLimits::default();
        let event = validate_event(valid(), &limits, NOW).unwrap();
        assert_eq!(event.path, "/orders");
        assert_eq!(event.query_params["page"], "1");
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let limits = ValidationLimits::default();
        let event = validate_event(
            json!({
                "timestamp_ms": NOW, "method": "DELETE", "path": "/",
                "status_code": 204, "latency_ms": 0
            }),
            &limits,
            NOW,
        )
        .unwrap();
        assert!(event.headers.is_empty());
        assert!(event.ip.is_none());
    }

    #[test]
    fn test_rejects_bad_events() {
        let limits = ValidationLimits::default();
        let cases = vec![
            json!("not an object"),
            with("status_code", json!("200")),
            with("status_code", json!(99)),
            with("status_code", json!(600)),
            with("path", json!("orders")),
            with("path", json!(format!("/{}", "a".repeat(2_048)))),
            with("method", json!("")),
            with("method", json!("VERYLONGMETHODNAME")),
            with("latency_ms", json!(-5)),
            with("country_code", json!("USA")),
            with("user_agent", json!("x".repeat(513))),
            with("headers", json!({"x-big": "y".repeat(9_000)})),
            with("query_params", json!({"q": "z".repeat(5_000)})),
        ];
        for case in cases {
            assert!(validate_event(case.clone(), &limits, NOW).is_err(), "accepted {case}");
        }

        let mut missing = valid();
        missing.as_object_mut().unwrap().remove("method");
        assert!(validate_event(missing, &limits, NOW).is_err());
    }

    #[test]
    fn test_rejects_timestamps_outside_clock_skew() {
        let limits = ValidationLimits::default();
        let ten_years_ms = 10 * 365 * 24 * 3_600 * 1_000i64;

        for timestamp in [NOW + ten_years_ms, NOW - 301_000, NOW + 301_000, 1] {
            let event = with("timestamp_ms", json!(timestamp));
            assert!(
                validate_event(event, &limits, NOW).is_err(),
                "accepted timestamp {timestamp}"
            );
        }
        for timestamp in [NOW - 300_000, NOW + 300_000] {
            let event = with("timestamp_ms", json!(timestamp));
            assert!(validate_event(event, &limits, NOW).is_ok());
        }
    }
}
