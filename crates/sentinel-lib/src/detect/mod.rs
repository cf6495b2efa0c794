//! Anomaly detection over request events
//!
//! This module provides:
//! - Time-bucketed rolling windows per (project, endpoint, detector)
//! - Rate, error-rate, geo, latency and new-endpoint detectors
//! - A per-IP rate detector spanning all of a project's endpoints
//! - A sharded engine fed by a pool of worker tasks

mod detectors;
mod engine;
mod window;

pub use detectors::{evaluate, Breach, DetectorPhase, DetectorState, WINDOWED_DETECTORS};
pub use engine::{
    spawn_workers, DetectionEngine, EngineHandle, Reservation, ShardKey, ALL_ENDPOINTS,
};
pub use window::{WindowState, LATENCY_BOUNDS_MS};
