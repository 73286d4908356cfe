//! In-memory storage backend for development and testing

use crate::{context_prefix, storage_key, StorageBackend, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// In-memory backend keyed by flat storage key
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, Value>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all contexts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, contexts: &[String], key: &str) -> Result<Option<Value>, StorageError> {
        let key = storage_key(contexts, key)?;
        Ok(self.entries.get(&key).map(|v| v.clone()))
    }

    async fn set(&self, contexts: &[String], key: &str, value: Value) -> Result<(), StorageError> {
        let key = storage_key(contexts, key)?;
        debug!("memory storage set {}", key);
        self.entries.insert(key, value);
        Ok(())
    }

    async fn delete(&self, contexts: &[String], key: &str) -> Result<(), StorageError> {
        let key = storage_key(contexts, key)?;
        self.entries.remove(&key);
        Ok(())
    }

    async fn keys(&self, contexts: &[String]) -> Result<Vec<String>, StorageError> {
        let prefix = context_prefix(contexts);
        Ok(self
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(&prefix)
                    .filter(|rest| !rest.contains('.'))
                    .map(str::to_string)
            })
            .collect())
    }
}
