//! Error taxonomy for the pipeline

use thiserror::Error;

use crate::models::DetectorKind;

/// Errors returned synchronously by the ingestion gateway
#[derive(Debug, Error)]
pub enum IngestError {
    /// Unknown or mismatched credential, batch rejected wholesale
    #[error("unauthorized: unknown or invalid project credential")]
    Unauthorized,

    /// Batch shape is unusable
    #[error("malformed batch: {0}")]
    Malformed(String),

    /// Pipeline saturated or draining, retry with backoff
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Persistence store failed, retry later
    #[error("ingestion unavailable: {0}")]
    Unavailable(String),
}

/// Errors from an alert channel adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel responded with status {0}")]
    Status(u16),

    #[error("invalid channel target: {0}")]
    InvalidTarget(String),

    #[error("channel not configured: {0}")]
    NotConfigured(String),
}

impl ChannelError {
    /// Whether retrying the same delivery can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport(_) => true,
            ChannelError::Status(code) => *code == 429 || *code >= 500,
            ChannelError::InvalidTarget(_) | ChannelError::NotConfigured(_) => false,
        }
    }
}

/// Internal detector failure, isolated per detector and endpoint
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectorError {
    #[error("{detector}: invalid setting {setting} = {value}")]
    InvalidSetting {
        detector: DetectorKind,
        setting: &'static str,
        value: String,
    },

    #[error("{0}: window has no latency samples")]
    EmptyHistogram(DetectorKind),
}

/// Errors from the exporter's batch transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("collector rejected credential")]
    Unauthorized,

    #[error("collector rejected batch as malformed: {0}")]
    Malformed(String),

    #[error("collector is rate limiting")]
    RateLimited,

    #[error("delivery failed: {0}")]
    Failed(String),
}

impl TransportError {
    /// Retryable failures are requeued, the rest drop the batch
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::RateLimited | TransportError::Failed(_))
    }
}

/// Errors from the append-only event store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors loading or validating pipeline configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration for project {project}: {message}")]
    Invalid { project: String, message: String },

    #[error("failed to watch configuration: {0}")]
    Watch(#[from] notify::Error),
}
