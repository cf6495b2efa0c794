//! Detector evaluation and the per-detector breach state machine
//!
//! Every (project, endpoint, detector) owns one [`DetectorState`]: its own
//! window plus a phase. Detectors never share mutable state.

use super::window::WindowState;
use crate::config::DetectorSettings;
use crate::error::DetectorError;
use crate::models::{DetectorKind, RequestEvent, Severity, WindowSummary};

/// Detector kinds that keep per-endpoint window state
pub const WINDOWED_DETECTORS: &[DetectorKind] = &[
    DetectorKind::Rate,
    DetectorKind::ErrorRate,
    DetectorKind::Geo,
    DetectorKind::Latency,
];

/// Lifecycle of one detector for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    /// Window is empty
    Idle,
    /// Window has traffic below the breach condition
    Accumulating,
    /// The latest event fired an anomaly. The next event inside the
    /// cooldown moves the detector to `Cooldown`.
    Breached,
    /// Recently breached, further breaches are suppressed until expiry
    Cooldown,
}

/// A detector firing, before it is turned into an anomaly event
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub severity: Severity,
    pub summary: WindowSummary,
}

#[derive(Debug, Clone)]
pub struct DetectorState {
    kind: DetectorKind,
    window: WindowState,
    phase: DetectorPhase,
    cooldown_until_ms: i64,
    last_seen_ms: i64,
}

impl DetectorState {
    pub fn new(kind: DetectorKind, settings: &DetectorSettings) -> Self {
        Self {
            kind,
            window: WindowState::new(settings.window_ms_for(kind), settings.bucket_ms()),
            phase: DetectorPhase::Idle,
            cooldown_until_ms: i64::MIN,
            last_seen_ms: i64::MIN,
        }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms
    }

    /// True when the window shape no longer matches `settings` (after a
    /// config reload) and the state has to start over
    pub fn is_stale(&self, settings: &DetectorSettings) -> bool {
        self.window.window_ms() != settings.window_ms_for(self.kind)
            || self.window.bucket_ms() != settings.bucket_ms().max(1)
    }

    /// Fold `event` into the window and evaluate. Returns a breach at most
    /// once per cooldown period; traffic during cooldown still updates the
    /// window.
    pub fn observe(
        &mut self,
        event: &RequestEvent,
        settings: &DetectorSettings,
    ) -> Result<Option<Breach>, DetectorError> {
        let now = event.timestamp_ms;
        self.last_seen_ms = self.last_seen_ms.max(now);
        self.window.record(event, settings.error_status_floor);

        let cooling = matches!(self.phase, DetectorPhase::Breached | DetectorPhase::Cooldown);
        if cooling && now < self.cooldown_until_ms {
            self.phase = DetectorPhase::Cooldown;
            return Ok(None);
        }

        match evaluate(self.kind, &self.window, event, settings)? {
            Some(breach) => {
                self.phase = DetectorPhase::Breached;
                self.cooldown_until_ms = now.saturating_add(settings.cooldown_ms());
                Ok(Some(breach))
            }
            None => {
                self.phase = if self.window.is_empty() {
                    DetectorPhase::Idle
                } else {
                    DetectorPhase::Accumulating
                };
                Ok(None)
            }
        }
    }
}

fn summary(window: &WindowState) -> WindowSummary {
    WindowSummary {
        window_secs: window.window_ms() as u64 / 1_000,
        request_count: window.request_count(),
        error_count: window.error_count(),
        observed: 0.0,
        threshold: 0.0,
        percentile_latency_ms: None,
        country_code: None,
        distinct_countries: window.distinct_countries(),
        client_ip: None,
    }
}

/// Check one detector's breach condition against its window
pub fn evaluate(
    kind: DetectorKind,
    window: &WindowState,
    event: &RequestEvent,
    settings: &DetectorSettings,
) -> Result<Option<Breach>, DetectorError> {
    match kind {
        DetectorKind::Rate => {
            let count = window.request_count();
            let threshold = settings.rate_threshold;
            if count <= threshold {
                return Ok(None);
            }
            let severity = if count > threshold.saturating_mul(2) {
                Severity::High
            } else {
                Severity::Medium
            };
            Ok(Some(Breach {
                severity,
                summary: WindowSummary {
                    observed: count as f64,
                    threshold: threshold as f64,
                    ..summary(window)
                },
            }))
        }

        DetectorKind::ErrorRate => {
            let threshold = settings.error_ratio_threshold;
            if !(0.0..=1.0).contains(&threshold) {
                return Err(DetectorError::InvalidSetting {
                    detector: kind,
                    setting: "error_ratio_threshold",
                    value: threshold.to_string(),
                });
            }
            if window.request_count() < settings.min_samples.max(1) {
                return Ok(None);
            }
            let ratio = window.error_ratio();
            if ratio <= threshold {
                return Ok(None);
            }
            let severity = if ratio >= 0.5 {
                Severity::High
            } else {
                Severity::Medium
            };
            Ok(Some(Breach {
                severity,
                summary: WindowSummary {
                    observed: ratio,
                    threshold,
                    ..summary(window)
                },
            }))
        }

        // Immediate: judged on the current request alone
        DetectorKind::Geo => {
            let Some(country) = event.country_code.as_deref() else {
                return Ok(None);
            };
            if !settings.geo.is_violation(country) {
                return Ok(None);
            }
            Ok(Some(Breach {
                severity: Severity::High,
                summary: WindowSummary {
                    observed: 1.0,
                    threshold: 0.0,
                    country_code: Some(country.to_string()),
                    ..summary(window)
                },
            }))
        }

        DetectorKind::Latency => {
            let percentile = settings.latency_percentile;
            if !(percentile > 0.0 && percentile <= 1.0) {
                return Err(DetectorError::InvalidSetting {
                    detector: kind,
                    setting: "latency_percentile",
                    value: percentile.to_string(),
                });
            }
            if window.request_count() < settings.min_samples.max(1) {
                return Ok(None);
            }
            let value = window
                .latency_percentile(percentile)
                .ok_or(DetectorError::EmptyHistogram(kind))?;
            let threshold = settings.latency_threshold_ms;
            if value <= threshold {
                return Ok(None);
            }
            let severity = if value > threshold.saturating_mul(2) {
                Severity::High
            } else {
                Severity::Medium
            };
            Ok(Some(Breach {
                severity,
                summary: WindowSummary {
                    observed: value as f64,
                    threshold: threshold as f64,
                    percentile_latency_ms: Some(value),
                    ..summary(window)
                },
            }))
        }

        DetectorKind::IpRate => {
            let Some(ip) = event.client_ip.as_deref() else {
                return Ok(None);
            };
            let count = window.request_count();
            let threshold = settings.ip_rate_threshold;
            if count <= threshold {
                return Ok(None);
            }
            let severity = if count > threshold.saturating_mul(2) {
                Severity::High
            } else {
                Severity::Medium
            };
            Ok(Some(Breach {
                severity,
                summary: WindowSummary {
                    observed: count as f64,
                    threshold: threshold as f64,
                    client_ip: Some(ip.to_string()),
                    ..summary(window)
                },
            }))
        }

        // Tracked by the engine's known-endpoint set, not by a window
        DetectorKind::NewEndpoint => Ok(None),
    }
}
