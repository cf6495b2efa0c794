//! Collector configuration

use anyhow::{Context, Result};
use sentinel_lib::alert::{EmailSettings, DEFAULT_DEDUP_BUCKET_SECS};
use sentinel_lib::backoff::RetryPolicy;
use sentinel_lib::ingest::ValidationLimits;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Collector configuration
///
/// Read from an optional file, then overlaid by `SENTINEL_*` environment
/// variables. Nested keys use a double underscore, e.g.
/// `SENTINEL_EMAIL__API_KEY`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Name used in structured logs
    pub instance: String,

    /// Port for the ingestion, health and metrics server
    pub port: u16,

    /// TOML file with the `[[projects]]` table, watched for changes
    pub projects_path: PathBuf,

    /// Append-only JSON lines file for accepted events
    pub event_log_path: PathBuf,

    pub engine_workers: usize,

    /// Capacity of each engine worker queue
    pub engine_queue_capacity: usize,

    pub anomaly_queue_capacity: usize,

    /// Time allowed for in-flight work after shutdown begins
    pub shutdown_grace_secs: u64,

    /// How often idle windows and stale dedup entries are swept
    pub sweep_interval_secs: u64,

    pub dedup_bucket_secs: u64,

    /// Timeout for a single channel delivery request
    pub channel_timeout_secs: u64,

    pub retry: RetryPolicy,
    pub email: EmailSettings,
    pub limits: ValidationLimits,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            port: 8080,
            projects_path: PathBuf::from("projects.toml"),
            event_log_path: PathBuf::from("events.jsonl"),
            engine_workers: 2,
            engine_queue_capacity: 10_000,
            anomaly_queue_capacity: 1_000,
            shutdown_grace_secs: 10,
            sweep_interval_secs: 30,
            dedup_bucket_secs: DEFAULT_DEDUP_BUCKET_SECS,
            channel_timeout_secs: 10,
            retry: RetryPolicy::default(),
            email: EmailSettings::default(),
            limits: ValidationLimits::default(),
        }
    }
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sentinel-collector".to_string())
}

impl CollectorConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read collector configuration")?;

        let mut config: Self = config
            .try_deserialize()
            .context("Invalid collector configuration")?;
        config.engine_workers = config.engine_workers.max(1);
        config.engine_queue_capacity = config.engine_queue_capacity.max(1);
        config.anomaly_queue_capacity = config.anomaly_queue_capacity.max(1);
        config.validate()?;
        Ok(config)
    }

    /// A whole batch may hash onto a single worker, so each worker queue
    /// must hold at least one full batch
    pub fn validate(&self) -> Result<()> {
        if self.engine_queue_capacity < self.limits.max_batch_events {
            anyhow::bail!(
                "engine_queue_capacity ({}) must be at least limits.max_batch_events ({})",
                self.engine_queue_capacity,
                self.limits.max_batch_events
            );
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs.max(1))
    }
}
