//! Append-only persistence of accepted request events
//!
//! The pipeline only ever writes here; the log feeds audit and dashboard
//! readers outside the collector.

use crate::error::StoreError;
use crate::models::RequestEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append a batch. Either every event is written or an error is returned.
    async fn append(&self, events: &[RequestEvent]) -> Result<(), StoreError>;
}

/// JSON Lines file, one event per line
pub struct JsonlEventStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Opened event log");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, events: &[RequestEvent]) -> Result<(), StoreError> {
        // Encode up front so a bad event cannot leave a partial batch behind
        let mut buf = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    events: Arc<Mutex<Vec<RequestEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RequestEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, events: &[RequestEvent]) -> Result<(), StoreError> {
        self.events.lock().await.extend_from_slice(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn event(path: &str) -> RequestEvent {
        RequestEvent {
            project_id: "shop".to_string(),
            timestamp_ms: 1_700_000_000_000,
            method: "GET".to_string(),
            path: path.to_string(),
            status_code: 200,
            latency_ms: 4,
            sanitized_headers: BTreeMap::new(),
            sanitized_query: BTreeMap::new(),
            client_ip: None,
            user_agent: None,
            country_code: None,
        }
    }

    #[tokio::test]
    async fn test_jsonl_store_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");

        let store = JsonlEventStore::open(&path).await.unwrap();
        store.append(&[event("/a"), event("/b")]).await.unwrap();
        store.append(&[event("/c")]).await.unwrap();
        drop(store);

        // Reopening appends rather than truncating
        let store = JsonlEventStore::open(&path).await.unwrap();
        store.append(&[event("/d")]).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let paths: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<RequestEvent>(l).unwrap().path)
            .collect();
        assert_eq!(paths, vec!["/a", "/b", "/c", "/d"]);
    }

    #[tokio::test]
    async fn test_memory_store_keeps_order() {
        let store = MemoryEventStore::new();
        store.append(&[event("/a"), event("/b")]).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.events().await[1].path, "/b");
    }
}
