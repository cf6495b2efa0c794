//! API Sentinel pipeline library
//!
//! This crate provides the core functionality for:
//! - Capturing, sanitizing and batching request telemetry in the host service
//! - Authenticating, validating and persisting batches at the collector
//! - Sliding-window anomaly detection per project and endpoint
//! - Alert dispatch with dedup, cooldown and retry
//! - Health checks and observability

pub mod alert;
pub mod backoff;
pub mod config;
pub mod detect;
pub mod error;
pub mod exporter;
pub mod health;
pub mod ingest;
pub mod models;
pub mod observability;

#[cfg(test)]
mod tests;

pub use config::{ConfigStore, PipelineConfig, ProjectConfig};
pub use error::{ChannelError, ConfigError, DetectorError, IngestError, StoreError, TransportError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, Lifecycle, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
