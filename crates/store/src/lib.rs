//! Durable blob storage for the delivery pipeline.
//!
//! The retry queue, audit backup and dead-letter records are each a single
//! named JSON document read and written wholesale on every mutation. The
//! `DurableStore` seam keeps callers independent of the backing medium.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Wholesale load/save of one JSON document.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Returns `None` when the document has never been written.
    async fn load(&self) -> Result<Option<serde_json::Value>, StoreError>;

    async fn save(&self, value: &serde_json::Value) -> Result<(), StoreError>;
}

/// Load a typed record list, treating an absent document as empty.
pub async fn load_records<T: DeserializeOwned>(
    store: &dyn DurableStore,
) -> Result<Vec<T>, StoreError> {
    match store.load().await? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(Vec::new()),
    }
}

/// Persist a typed record list wholesale.
pub async fn save_records<T: Serialize>(
    store: &dyn DurableStore,
    records: &[T],
) -> Result<(), StoreError> {
    let value = serde_json::to_value(records)?;
    store.save(&value).await
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    value: Mutex<Option<serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.value.lock().await.clone())
    }

    async fn save(&self, value: &serde_json::Value) -> Result<(), StoreError> {
        *self.value.lock().await = Some(value.clone());
        Ok(())
    }
}

/// File-backed store. Writes go to a sibling temp file then rename, so a
/// crash mid-write never truncates the previous document.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self) -> Result<Option<serde_json::Value>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, value: &serde_json::Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec(value)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();

        assert!(store.load().await.unwrap().is_none());
        store.save(&json!([{"retryCount": 0}])).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(json!([{"retryCount": 0}])));
    }

    #[tokio::test]
    async fn test_save_overwrites_wholesale() {
        let store = MemoryStore::new();
        store.save(&json!([1, 2, 3])).await.unwrap();
        store.save(&json!([4])).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(json!([4])));
    }

    #[tokio::test]
    async fn test_typed_record_helpers() {
        let store = MemoryStore::new();

        let empty: Vec<u32> = load_records(&store).await.unwrap();
        assert!(empty.is_empty());

        save_records(&store, &[10u32, 20]).await.unwrap();
        let loaded: Vec<u32> = load_records(&store).await.unwrap();
        assert_eq!(loaded, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("courier-store-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let store = FileStore::new(dir.join("queue.json"));

        assert!(store.load().await.unwrap().is_none());
        store.save(&json!({"items": []})).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(json!({"items": []})));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
