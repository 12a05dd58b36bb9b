//! Keyed byte persistence for aggregation records and watcher state

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Key namespace for prophecy records
pub const PROPHECY_PREFIX: &[u8] = b"prophecy/";
/// Key namespace for withdraw request records
pub const WITHDRAW_PREFIX: &[u8] = b"withdraw/";
/// Key namespace for chain watcher watermarks
pub const WATERMARK_PREFIX: &[u8] = b"watermark/";
/// Key namespace for settlement delivery markers
pub const SETTLED_PREFIX: &[u8] = b"settled/";

/// Build a namespaced store key
pub fn namespaced_key(prefix: &[u8], id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + id.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(id);
    key
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Durable key/value store.
///
/// `set` must not return until the value is durable; callers acknowledge
/// submissions and shutdown only after it returns.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// All keys under `prefix`
    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError>;
}

/// In-memory store for tests and non-durable deployments
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_vec(), value);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys: Vec<Vec<u8>> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
