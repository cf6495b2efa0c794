//! Time-bucketed rolling window
//!
//! Each window keeps a queue of fixed-width buckets plus running totals.
//! Expired buckets are popped from the front and subtracted from the
//! totals, so advancing the window costs O(1) amortized per event instead
//! of rescanning history.

use crate::models::RequestEvent;
use std::collections::{HashMap, VecDeque};

/// Upper bounds (inclusive, milliseconds) of the latency histogram buckets.
/// Latencies above the last bound land in an overflow bucket.
pub const LATENCY_BOUNDS_MS: &[u64] = &[
    5, 10, 25, 50, 75, 100, 150, 200, 300, 400, 500, 750, 1_000, 1_500, 2_000, 3_000, 5_000,
    7_500, 10_000, 15_000, 30_000,
];

const HISTOGRAM_SLOTS: usize = LATENCY_BOUNDS_MS.len() + 1;

fn latency_slot(latency_ms: u64) -> usize {
    LATENCY_BOUNDS_MS
        .iter()
        .position(|bound| latency_ms <= *bound)
        .unwrap_or(LATENCY_BOUNDS_MS.len())
}

/// Aggregates for one bucket, or for the whole window
#[derive(Debug, Clone)]
struct Tally {
    requests: u64,
    errors: u64,
    latency: [u64; HISTOGRAM_SLOTS],
    max_latency_ms: u64,
    countries: HashMap<String, u64>,
}

impl Default for Tally {
    fn default() -> Self {
        Self {
            requests: 0,
            errors: 0,
            latency: [0; HISTOGRAM_SLOTS],
            max_latency_ms: 0,
            countries: HashMap::new(),
        }
    }
}

impl Tally {
    fn add(&mut self, event: &RequestEvent, is_error: bool) {
        self.requests += 1;
        if is_error {
            self.errors += 1;
        }
        self.latency[latency_slot(event.latency_ms)] += 1;
        self.max_latency_ms = self.max_latency_ms.max(event.latency_ms);
        if let Some(country) = &event.country_code {
            *self.countries.entry(country.clone()).or_insert(0) += 1;
        }
    }

    fn subtract(&mut self, other: &Tally) {
        self.requests = self.requests.saturating_sub(other.requests);
        self.errors = self.errors.saturating_sub(other.errors);
        for (slot, count) in self.latency.iter_mut().zip(other.latency.iter()) {
            *slot = slot.saturating_sub(*count);
        }
        for (country, count) in &other.countries {
            if let Some(total) = self.countries.get_mut(country) {
                *total = total.saturating_sub(*count);
                if *total == 0 {
                    self.countries.remove(country);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    start_ms: i64,
    tally: Tally,
}

/// Rolling aggregate for one (project, endpoint, detector)
#[derive(Debug, Clone)]
pub struct WindowState {
    window_ms: i64,
    bucket_ms: i64,
    buckets: VecDeque<Bucket>,
    totals: Tally,
    latest_ms: i64,
}

impl WindowState {
    pub fn new(window_ms: i64, bucket_ms: i64) -> Self {
        let bucket_ms = bucket_ms.max(1);
        Self {
            window_ms: window_ms.max(bucket_ms),
            bucket_ms,
            buckets: VecDeque::new(),
            totals: Tally::default(),
            latest_ms: i64::MIN,
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn bucket_ms(&self) -> i64 {
        self.bucket_ms
    }

    /// Add an event, counting it as an error when its status is at or above
    /// `error_floor`
    pub fn record(&mut self, event: &RequestEvent, error_floor: u16) {
        self.advance(event.timestamp_ms);
        let is_error = event.status_code >= error_floor;

        // Late events count toward the newest bucket
        let at = event.timestamp_ms.max(self.latest_ms);
        let start_ms = at - at.rem_euclid(self.bucket_ms);

        match self.buckets.back_mut() {
            Some(bucket) if bucket.start_ms >= start_ms => bucket.tally.add(event, is_error),
            _ => {
                let mut tally = Tally::default();
                tally.add(event, is_error);
                self.buckets.push_back(Bucket { start_ms, tally });
            }
        }
        self.totals.add(event, is_error);
    }

    /// Move the window's right edge to `now_ms`, expiring buckets that start
    /// at or before `now_ms - window`
    pub fn advance(&mut self, now_ms: i64) {
        if now_ms > self.latest_ms {
            self.latest_ms = now_ms;
        }
        let cutoff = self.latest_ms - self.window_ms;
        while let Some(front) = self.buckets.front() {
            if front.start_ms <= cutoff {
                if let Some(expired) = self.buckets.pop_front() {
                    self.totals.subtract(&expired.tally);
                }
            } else {
                break;
            }
        }
        if self.buckets.is_empty() {
            // Drop max-latency and rounding residue once nothing is left
            self.totals = Tally::default();
        }
    }

    pub fn request_count(&self) -> u64 {
        self.totals.requests
    }

    pub fn error_count(&self) -> u64 {
        self.totals.errors
    }

    pub fn is_empty(&self) -> bool {
        self.totals.requests == 0
    }

    pub fn error_ratio(&self) -> f64 {
        if self.totals.requests == 0 {
            return 0.0;
        }
        self.totals.errors as f64 / self.totals.requests as f64
    }

    pub fn distinct_countries(&self) -> usize {
        self.totals.countries.len()
    }

    /// Estimated latency at `percentile` (0, 1]: the upper bound of the
    /// histogram bucket holding that rank. Ranks in the overflow bucket
    /// report the largest latency still in the window.
    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let total = self.totals.requests;
        if total == 0 {
            return None;
        }
        let rank = ((percentile * total as f64).ceil() as u64).clamp(1, total);

        let mut seen = 0u64;
        for (slot, count) in self.totals.latency.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return Some(match LATENCY_BOUNDS_MS.get(slot) {
                    Some(bound) => *bound,
                    None => self.max_latency_in_window(),
                });
            }
        }
        None
    }

    fn max_latency_in_window(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.tally.max_latency_ms)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event(ts_ms: i64, status: u16, latency_ms: u64, country: Option<&str>) -> RequestEvent {
        RequestEvent {
            project_id: "p".to_string(),
            timestamp_ms: ts_ms,
            method: "GET".to_string(),
            path: "/orders".to_string(),
            status_code: status,
            latency_ms,
            sanitized_headers: BTreeMap::new(),
            sanitized_query: BTreeMap::new(),
            client_ip: None,
            user_agent: None,
            country_code: country.map(str::to_string),
        }
    }

    #[test]
    fn test_counts_within_window() {
        let mut window = WindowState::new(10_000, 1_000);
        for i in 0..20 {
            let status = if i % 4 == 0 { 503 } else { 200 };
            window.record(&event(i * 100, status, 20, None), 500);
        }

        assert_eq!(window.request_count(), 20);
        assert_eq!(window.error_count(), 5);
        assert!((window.error_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_old_buckets_expire() {
        let mut window = WindowState::new(10_000, 1_000);
        // One request per second for 30 seconds
        for i in 0..30 {
            window.record(&event(i * 1_000, 200, 20, None), 500);
        }

        // Buckets [20s..29s] remain
        assert_eq!(window.request_count(), 10);

        window.advance(100_000);
        assert!(window.is_empty());
        assert_eq!(window.latency_percentile(0.95), None);
    }

    #[test]
    fn test_late_event_counts_in_newest_bucket() {
        let mut window = WindowState::new(5_000, 1_000);
        window.record(&event(10_000, 200, 20, None), 500);
        window.record(&event(2_000, 200, 20, None), 500);

        assert_eq!(window.request_count(), 2);
        window.advance(15_500);
        assert!(window.is_empty());
    }

    #[test]
    fn test_latency_percentile_from_histogram() {
        let mut window = WindowState::new(60_000, 1_000);
        for i in 0..95 {
            window.record(&event(i, 200, 40, None), 500);
        }
        for i in 0..5 {
            window.record(&event(100 + i, 200, 900, None), 500);
        }

        // 95th ranked sample sits in the (25, 50] bucket
        assert_eq!(window.latency_percentile(0.95), Some(50));
        // Anything above it lands in the (750, 1000] bucket
        assert_eq!(window.latency_percentile(0.99), Some(1_000));
    }

    #[test]
    fn test_overflow_percentile_reports_max() {
        let mut window = WindowState::new(60_000, 1_000);
        window.record(&event(0, 200, 45_000, None), 500);
        assert_eq!(window.latency_percentile(0.5), Some(45_000));
    }

    #[test]
    fn test_distinct_countries_expire() {
        let mut window = WindowState::new(2_000, 1_000);
        window.record(&event(0, 200, 10, Some("DE")), 500);
        window.record(&event(500, 200, 10, Some("FR")), 500);
        window.record(&event(1_500, 200, 10, Some("DE")), 500);
        assert_eq!(window.distinct_countries(), 2);

        window.advance(2_500);
        assert_eq!(window.distinct_countries(), 1);
    }
}
