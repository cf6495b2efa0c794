//! Component health and lifecycle tracking for the collector
//!
//! Backs the `/healthz` and `/readyz` endpoints. Components report their
//! own state; the registry folds them into an overall status.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operating with reduced guarantees (e.g. shedding load)
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Lifecycle phase of the collector process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Ready,
    Draining,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub lifecycle: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const GATEWAY: &str = "gateway";
    pub const EVENT_STORE: &str = "event_store";
    pub const ENGINE: &str = "engine";
    pub const DISPATCHER: &str = "dispatcher";
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    lifecycle: Arc<RwLock<Lifecycle>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: Arc::new(RwLock::new(Lifecycle::Starting)),
        }
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        // Skip rewrites that change nothing so timestamps reflect transitions
        if let Some(current) = components.get(name) {
            if current.status == status && current.message == message {
                return;
            }
        }
        components.insert(name.to_string(), ComponentHealth::with(status, message));
    }

    pub async fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.write().await = lifecycle;
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    /// Worst component status wins
    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let lifecycle = self.lifecycle().await;
        let health = self.health().await;

        let reason = match lifecycle {
            Lifecycle::Starting => Some("collector still starting".to_string()),
            Lifecycle::Draining => Some("collector draining for shutdown".to_string()),
            Lifecycle::Ready if health.status == ComponentStatus::Unhealthy => {
                Some("a pipeline component is unhealthy".to_string())
            }
            Lifecycle::Ready => None,
        };

        ReadinessResponse {
            ready: reason.is_none(),
            lifecycle,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::GATEWAY).await;
        registry.register(components::EVENT_STORE).await;

        registry
            .set_degraded(components::GATEWAY, "shedding load")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::EVENT_STORE, "disk full")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.set_healthy(components::EVENT_STORE).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_readiness_follows_lifecycle() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.set_lifecycle(Lifecycle::Ready).await;
        assert!(registry.readiness().await.ready);

        registry.set_lifecycle(Lifecycle::Draining).await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.lifecycle, Lifecycle::Draining);
    }

    #[tokio::test]
    async fn test_not_ready_when_component_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::ENGINE).await;
        registry.set_lifecycle(Lifecycle::Ready).await;
        registry.set_unhealthy(components::ENGINE, "workers gone").await;

        assert!(!registry.readiness().await.ready);
    }
}
