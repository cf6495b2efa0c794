//! Per-project pipeline configuration
//!
//! Projects are described in a TOML file with `[[projects]]` entries. Every
//! setting has a default, so a minimal project needs only an id and a key
//! hash. The file is hot-reloadable: [`ConfigWatcher`] swaps a freshly
//! validated snapshot into the shared [`ConfigStore`].

use crate::error::ConfigError;
use crate::models::{AlertChannel, ChannelKind, DetectorKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Headers redacted when no list is configured
pub const DEFAULT_SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Query parameter fragments redacted when no list is configured
pub const DEFAULT_SENSITIVE_PARAMS: &[&str] = &["password", "token", "key", "secret", "auth"];

/// Countries flagged by the geo detector in deny-list mode by default
pub const DEFAULT_DENIED_COUNTRIES: &[&str] = &["KP", "IR", "SY", "CU"];

/// Top-level pipeline configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// Settings for one monitored project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Hex-encoded SHA-256 of the project's API key
    pub key_sha256: String,
    /// Path prefixes that are stored but never analyzed
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
    #[serde(default = "default_sensitive_params")]
    pub sensitive_params: Vec<String>,
    #[serde(default)]
    pub detectors: DetectorSettings,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl ProjectConfig {
    /// Minimal project with default settings
    pub fn new(id: impl Into<String>, key_sha256: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            key_sha256: key_sha256.into(),
            ignore_paths: Vec::new(),
            sensitive_headers: default_sensitive_headers(),
            sensitive_params: default_sensitive_params(),
            detectors: DetectorSettings::default(),
            channels: Vec::new(),
        }
    }

    /// Whether detection should skip this path
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Alert channels resolved for this project
    pub fn alert_channels(&self) -> Vec<AlertChannel> {
        self.channels
            .iter()
            .map(|c| AlertChannel {
                id: c.id.clone(),
                project_id: self.id.clone(),
                kind: c.kind,
                target: c.target.clone(),
                cooldown_secs: c.cooldown_secs,
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            project: self.id.clone(),
            message,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("project id is empty".to_string()));
        }
        if self.key_sha256.len() != 64 || hex::decode(&self.key_sha256).is_err() {
            return Err(invalid("key_sha256 must be 64 hex characters".to_string()));
        }

        let d = &self.detectors;
        if d.bucket_secs == 0 || d.window_secs < d.bucket_secs {
            return Err(invalid(format!(
                "window_secs ({}) must be >= bucket_secs ({}) > 0",
                d.window_secs, d.bucket_secs
            )));
        }
        if d.ip_window_secs < d.bucket_secs {
            return Err(invalid(format!(
                "ip_window_secs ({}) must be >= bucket_secs ({})",
                d.ip_window_secs, d.bucket_secs
            )));
        }
        if !(0.0..=1.0).contains(&d.error_ratio_threshold) {
            return Err(invalid("error_ratio_threshold must be within 0..=1".to_string()));
        }
        if !(d.latency_percentile > 0.0 && d.latency_percentile <= 1.0) {
            return Err(invalid("latency_percentile must be within (0, 1]".to_string()));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.as_str()) {
                return Err(invalid(format!("duplicate channel id {}", channel.id)));
            }
        }
        Ok(())
    }
}

fn default_sensitive_headers() -> Vec<String> {
    DEFAULT_SENSITIVE_HEADERS.iter().map(|s| s.to_string()).collect()
}

fn default_sensitive_params() -> Vec<String> {
    DEFAULT_SENSITIVE_PARAMS.iter().map(|s| s.to_string()).collect()
}

/// Thresholds and windowing for the project's detectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub enabled: Vec<DetectorKind>,
    /// Rolling window length
    pub window_secs: u64,
    /// Width of one time bucket inside the window
    pub bucket_secs: u64,
    /// Requests per window above which the rate detector fires
    pub rate_threshold: u64,
    /// Requests from one IP per `ip_window_secs` above which the per-IP
    /// rate detector fires
    pub ip_rate_threshold: u64,
    pub ip_window_secs: u64,
    pub error_ratio_threshold: f64,
    /// Lowest status code counted as an error
    pub error_status_floor: u16,
    /// Samples required before ratio and percentile detectors evaluate
    pub min_samples: u64,
    pub latency_percentile: f64,
    pub latency_threshold_ms: u64,
    pub geo: GeoPolicy,
    pub cooldown_secs: u64,
    pub idle_ttl_secs: u64,
    pub max_known_endpoints: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            enabled: vec![
                DetectorKind::Rate,
                DetectorKind::ErrorRate,
                DetectorKind::Geo,
                DetectorKind::Latency,
                DetectorKind::IpRate,
            ],
            window_secs: 60,
            bucket_secs: 1,
            rate_threshold: 100,
            ip_rate_threshold: 100,
            ip_window_secs: 60,
            error_ratio_threshold: 0.2,
            error_status_floor: 500,
            min_samples: 10,
            latency_percentile: 0.95,
            latency_threshold_ms: 1000,
            geo: GeoPolicy::default(),
            cooldown_secs: 300,
            idle_ttl_secs: 900,
            max_known_endpoints: 10_000,
        }
    }
}

impl DetectorSettings {
    pub fn is_enabled(&self, kind: DetectorKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn window_ms(&self) -> i64 {
        self.window_secs as i64 * 1000
    }

    pub fn bucket_ms(&self) -> i64 {
        self.bucket_secs as i64 * 1000
    }

    /// Window length used by `kind`
    pub fn window_secs_for(&self, kind: DetectorKind) -> u64 {
        match kind {
            DetectorKind::IpRate => self.ip_window_secs,
            _ => self.window_secs,
        }
    }

    pub fn window_ms_for(&self, kind: DetectorKind) -> i64 {
        self.window_secs_for(kind) as i64 * 1000
    }

    pub fn cooldown_ms(&self) -> i64 {
        self.cooldown_secs as i64 * 1000
    }

    pub fn idle_ttl_ms(&self) -> i64 {
        self.idle_ttl_secs as i64 * 1000
    }
}

/// Geo detector list semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    /// Listed countries breach
    Deny,
    /// Countries not listed breach
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoPolicy {
    pub mode: GeoMode,
    pub countries: Vec<String>,
}

impl Default for GeoPolicy {
    fn default() -> Self {
        Self {
            mode: GeoMode::Deny,
            countries: DEFAULT_DENIED_COUNTRIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl GeoPolicy {
    /// Whether a request from `country` breaches the policy
    pub fn is_violation(&self, country: &str) -> bool {
        let listed = self.countries.iter().any(|c| c.eq_ignore_ascii_case(country));
        match self.mode {
            GeoMode::Deny => listed,
            GeoMode::Allow => !listed,
        }
    }
}

/// One alert channel of a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub kind: ChannelKind,
    /// URL for webhook and Slack, address for email
    pub target: String,
    #[serde(default = "default_channel_cooldown")]
    pub cooldown_secs: u64,
}

fn default_channel_cooldown() -> u64 {
    600
}

impl PipelineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for project in &self.projects {
            project.validate()?;
            if !ids.insert(project.id.as_str()) {
                return Err(ConfigError::Invalid {
                    project: project.id.clone(),
                    message: "duplicate project id".to_string(),
                });
            }
        }
        Ok(())
    }
}

type ProjectIndex = HashMap<String, Arc<ProjectConfig>>;

/// Shared, hot-swappable view of the project configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    projects: Arc<RwLock<Arc<ProjectIndex>>>,
}

impl ConfigStore {
    pub fn new(config: PipelineConfig) -> Self {
        let store = Self::default();
        store.replace(config);
        store
    }

    /// Swap in a new configuration snapshot
    pub fn replace(&self, config: PipelineConfig) {
        let index: ProjectIndex = config
            .projects
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(p)))
            .collect();
        let count = index.len();
        let mut guard = self.projects.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(index);
        debug!(projects = count, "Configuration snapshot installed");
    }

    fn snapshot(&self) -> Arc<ProjectIndex> {
        self.projects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn project(&self, id: &str) -> Option<Arc<ProjectConfig>> {
        self.snapshot().get(id).cloned()
    }

    pub fn projects(&self) -> Vec<Arc<ProjectConfig>> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

/// Reloads the configuration file into a [`ConfigStore`] when it changes
pub struct ConfigWatcher {
    path: PathBuf,
    store: ConfigStore,
}

/// Keeps the watcher alive; dropping it stops reloads
pub struct ConfigWatcherHandle {
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, store: ConfigStore) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    /// Start watching the file's directory for changes to it
    pub fn start(self) -> Result<ConfigWatcherHandle, ConfigError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        // Editors often replace the file, so watch the parent directory
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %self.path.display(), "Watching project configuration");

        let path = self.path;
        let store = self.store;
        let file_name = path.file_name().map(|n| n.to_os_string());

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                let touches_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if touches_file {
                    reload_into(&path, &store);
                }
            }
            debug!("Configuration watcher channel closed");
        });

        Ok(ConfigWatcherHandle {
            _watcher: watcher,
            _task: task,
        })
    }
}

/// Reload `path` into `store`, keeping the previous snapshot on error
pub fn reload_into(path: &Path, store: &ConfigStore) -> bool {
    match PipelineConfig::load(path) {
        Ok(config) => {
            let count = config.projects.len();
            store.replace(config);
            info!(path = %path.display(), projects = count, "Project configuration reloaded");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Rejected configuration reload, keeping previous");
            false
        }
    }
}
