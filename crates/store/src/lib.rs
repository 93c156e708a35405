//! kstore store: the byte-level backend contract the registry is written against,
//! plus the in-memory backend.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kstore_core::ObjectKey;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value contract for one resource type. Values are opaque encoded records.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn exists(&self, key: &ObjectKey) -> StoreResult<bool>;

    /// `NotFound` when no record is stored for `key`.
    async fn read(&self, key: &ObjectKey) -> StoreResult<Vec<u8>>;

    /// Upsert.
    async fn write(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()>;

    /// Insert only if absent; `AlreadyExists` otherwise. Check and write are one step.
    async fn insert(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()>;

    /// Overwrite an existing record; `NotFound` if it is gone. Check and write are one step.
    async fn replace(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()>;

    /// `NotFound` when no record is stored for `key`.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// All records, unordered.
    async fn list(&self) -> StoreResult<Vec<Vec<u8>>>;

    async fn list_with_keys(&self) -> StoreResult<Vec<(ObjectKey, Vec<u8>)>>;

    /// Prepare the schema; idempotent. Must run before first use.
    async fn migrate(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str;
}

/// Process-local backend: one map from rendered key (`ns/name` or `name`) to bytes.
#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn len(&self) -> usize { self.items.read().await.len() }
    pub async fn is_empty(&self) -> bool { self.items.read().await.is_empty() }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn exists(&self, key: &ObjectKey) -> StoreResult<bool> {
        Ok(self.items.read().await.contains_key(&key.to_string()))
    }

    async fn read(&self, key: &ObjectKey) -> StoreResult<Vec<u8>> {
        let k = key.to_string();
        self.items.read().await.get(&k).cloned().ok_or(StoreError::NotFound(k))
    }

    async fn write(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()> {
        self.items.write().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn insert(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()> {
        use std::collections::hash_map::Entry;
        let mut items = self.items.write().await;
        match items.entry(key.to_string()) {
            Entry::Occupied(e) => Err(StoreError::AlreadyExists(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(data.to_vec());
                Ok(())
            }
        }
    }

    async fn replace(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()> {
        let k = key.to_string();
        match self.items.write().await.get_mut(&k) {
            Some(slot) => {
                *slot = data.to_vec();
                Ok(())
            }
            None => Err(StoreError::NotFound(k)),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let k = key.to_string();
        match self.items.write().await.remove(&k) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(k)),
        }
    }

    async fn list(&self) -> StoreResult<Vec<Vec<u8>>> {
        let items = self.items.read().await;
        debug!(count = items.len(), "memory store list");
        Ok(items.values().cloned().collect())
    }

    async fn list_with_keys(&self) -> StoreResult<Vec<(ObjectKey, Vec<u8>)>> {
        let items = self.items.read().await;
        Ok(items.iter().map(|(k, v)| (ObjectKey::parse(k), v.clone())).collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
