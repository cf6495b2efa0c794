//! Project lookup by API credential

use crate::config::ConfigStore;
use crate::models::Project;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Resolves a bearer credential to the project it belongs to
#[async_trait]
pub trait ProjectRegistry: Send + Sync + 'static {
    async fn lookup(&self, credential: &str) -> Option<Project>;
}

/// Hex-encoded SHA-256 of a credential, as stored in project config
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Registry backed by the hot-reloadable project configuration
#[derive(Debug, Clone)]
pub struct StaticRegistry {
    store: ConfigStore,
}

impl StaticRegistry {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProjectRegistry for StaticRegistry {
    async fn lookup(&self, credential: &str) -> Option<Project> {
        if credential.is_empty() {
            return None;
        }
        let hash = hash_credential(credential);
        self.store
            .projects()
            .into_iter()
            .find(|p| p.key_sha256.eq_ignore_ascii_case(&hash))
            .map(|p| Project {
                id: p.id.clone(),
                name: p.name.clone(),
                key_hash: p.key_sha256.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, ProjectConfig};

    #[test]
    fn test_hash_credential() {
        assert_eq!(
            hash_credential("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[tokio::test]
    async fn test_lookup_follows_config_reload() {
        let store = ConfigStore::new(PipelineConfig {
            projects: vec![ProjectConfig::new("shop", hash_credential("sk_one"))],
        });
        let registry = StaticRegistry::new(store.clone());

        assert_eq!(registry.lookup("sk_one").await.unwrap().id, "shop");
        assert!(registry.lookup("sk_two").await.is_none());
        assert!(registry.lookup("").await.is_none());

        store.replace(PipelineConfig {
            projects: vec![ProjectConfig::new("shop", hash_credential("sk_two"))],
        });
        assert!(registry.lookup("sk_one").await.is_none());
        assert_eq!(registry.lookup("sk_two").await.unwrap().id, "shop");
    }
}
