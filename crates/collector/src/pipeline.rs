//! Wiring of gateway, detection workers, dispatcher and background sweeps

use crate::config::CollectorConfig;
use anyhow::{Context, Result};
use sentinel_lib::{
    alert::{AlertDispatcher, EmailAdapter, SlackAdapter, WebhookAdapter},
    config::{ConfigStore, ConfigWatcher, ConfigWatcherHandle, PipelineConfig},
    detect::{spawn_workers, DetectionEngine, EngineHandle},
    health::{components, HealthRegistry, Lifecycle},
    ingest::{EventStore, IngestGateway, JsonlEventStore, StaticRegistry},
    observability::{PipelineMetrics, StructuredLogger},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Running collector pipeline
pub struct Pipeline {
    gateway: Arc<IngestGateway>,
    projects: ConfigStore,
    health: HealthRegistry,
    logger: StructuredLogger,
    dispatcher: Arc<AlertDispatcher>,
    workers: Vec<Supervised>,
    dispatcher_task: Supervised,
    sweeper: JoinHandle<()>,
    _watcher: Option<ConfigWatcherHandle>,
}

impl Pipeline {
    /// Load project configuration, open the event log and start every task
    pub async fn start(
        config: &CollectorConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Result<Self> {
        let pipeline_config = if config.projects_path.exists() {
            PipelineConfig::load(&config.projects_path).with_context(|| {
                format!(
                    "Failed to load projects from {}",
                    config.projects_path.display()
                )
            })?
        } else {
            warn!(
                path = %config.projects_path.display(),
                "Projects file not found, starting with no projects"
            );
            PipelineConfig::default()
        };
        let projects = ConfigStore::new(pipeline_config);

        let store = JsonlEventStore::open(&config.event_log_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open event log {}",
                    config.event_log_path.display()
                )
            })?;

        let mut pipeline = Self::build(config, projects.clone(), Arc::new(store), health, logger);

        if config.projects_path.exists() {
            match ConfigWatcher::new(&config.projects_path, projects).start() {
                Ok(handle) => pipeline._watcher = Some(handle),
                Err(e) => warn!(error = %e, "Project configuration will not hot-reload"),
            }
        }

        Ok(pipeline)
    }

    /// Assemble the pipeline around an existing project store and event store
    pub fn build(
        config: &CollectorConfig,
        projects: ConfigStore,
        store: Arc<dyn EventStore>,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        let metrics = PipelineMetrics::new();

        let (engine_handle, receivers) =
            EngineHandle::channel(config.engine_workers, config.engine_queue_capacity);
        let engine = Arc::new(DetectionEngine::new(
            projects.clone(),
            metrics.clone(),
            logger.clone(),
        ));
        let (anomaly_tx, anomaly_rx) = mpsc::channel(config.anomaly_queue_capacity);
        let workers = spawn_workers(Arc::clone(&engine), receivers, anomaly_tx)
            .into_iter()
            .map(|worker| supervise(worker, components::ENGINE, health.clone()))
            .collect();

        let timeout = config.channel_timeout();
        let dispatcher = Arc::new(
            AlertDispatcher::new(projects.clone(), config.retry, metrics.clone(), logger.clone())
                .with_dedup_bucket_secs(config.dedup_bucket_secs)
                .with_adapter(Arc::new(WebhookAdapter::new(timeout)))
                .with_adapter(Arc::new(SlackAdapter::new(timeout)))
                .with_adapter(Arc::new(EmailAdapter::new(config.email.clone(), timeout)))
                .with_health(health.clone()),
        );
        let dispatcher_task = supervise(
            tokio::spawn(Arc::clone(&dispatcher).run(anomaly_rx)),
            components::DISPATCHER,
            health.clone(),
        );

        let gateway = Arc::new(IngestGateway::new(
            Arc::new(StaticRegistry::new(projects.clone())),
            store,
            projects.clone(),
            engine_handle,
            config.limits,
            metrics,
            logger.clone(),
            health.clone(),
        ));

        let sweeper = tokio::spawn(sweep(
            engine,
            Arc::clone(&dispatcher),
            config.sweep_interval(),
        ));

        Self {
            gateway,
            projects,
            health,
            logger,
            dispatcher,
            workers,
            dispatcher_task,
            sweeper,
            _watcher: None,
        }
    }

    pub fn gateway(&self) -> Arc<IngestGateway> {
        Arc::clone(&self.gateway)
    }

    pub fn projects(&self) -> &ConfigStore {
        &self.projects
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Register components and report ready
    pub async fn mark_ready(&self) {
        for component in [
            components::GATEWAY,
            components::EVENT_STORE,
            components::ENGINE,
            components::DISPATCHER,
        ] {
            self.health.register(component).await;
        }
        self.health.set_lifecycle(Lifecycle::Ready).await;
    }

    /// Stop intake, then let detection and dispatch finish within `grace`.
    /// Work still running when the grace period ends is abandoned.
    pub async fn shutdown(self, grace: Duration) {
        self.health.set_lifecycle(Lifecycle::Draining).await;
        // Dropping the engine handle closes the worker queues
        drop(self.gateway.stop_accepting());
        self.sweeper.abort();

        let deadline = Instant::now() + grace;

        let mut unfinished = Vec::new();
        for mut worker in self.workers {
            if tokio::time::timeout_at(deadline, &mut worker.watcher)
                .await
                .is_err()
            {
                unfinished.push(worker);
            }
        }
        if !unfinished.is_empty() {
            self.logger.log_abandoned(components::ENGINE, unfinished.len());
            for worker in &unfinished {
                worker.task.abort();
            }
            // Aborted workers release their anomaly senders
            for worker in unfinished {
                let _ = worker.watcher.await;
            }
        }

        let mut dispatcher_task = self.dispatcher_task;
        if tokio::time::timeout_at(deadline, &mut dispatcher_task.watcher)
            .await
            .is_err()
        {
            self.logger.log_abandoned(components::DISPATCHER, 1);
            dispatcher_task.task.abort();
        }

        info!("Pipeline stopped");
    }
}

/// A long-running task and the watcher that awaits it
struct Supervised {
    watcher: JoinHandle<()>,
    task: AbortHandle,
}

/// Mark `component` unhealthy if `task` ends before shutdown begins
fn supervise(task: JoinHandle<()>, component: &'static str, health: HealthRegistry) -> Supervised {
    let abort = task.abort_handle();
    let watcher = tokio::spawn(async move {
        let outcome = task.await;
        if health.lifecycle().await == Lifecycle::Draining {
            return;
        }
        let message = match outcome {
            Ok(()) => "task stopped unexpectedly".to_string(),
            Err(e) if e.is_panic() => "task panicked".to_string(),
            Err(e) => format!("task failed: {e}"),
        };
        error!(component, reason = %message, "Pipeline task ended outside shutdown");
        health.set_unhealthy(component, message).await;
    });
    Supervised {
        watcher,
        task: abort,
    }
}

/// Periodically evict idle windows and forget expired dedup and cooldown
/// entries
async fn sweep(engine: Arc<DetectionEngine>, dispatcher: Arc<AlertDispatcher>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let evicted = engine.evict_idle(now_ms);
        dispatcher.prune(now_ms);
        if evicted > 0 {
            info!(evicted, shards = engine.shard_count(), "Evicted idle windows");
        }
    }
}
