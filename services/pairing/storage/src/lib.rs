//! Context-scoped key/value storage for pairing state.
//!
//! Values are JSON documents addressed by a context path plus a key, e.g.
//! `["fabrics"] / "nextFabricIndex"`. Backends implement [`StorageBackend`];
//! callers work through [`StorageContext`], which adds typed serde access.
//! Missing keys read as `None`; undecodable data is a [`StorageError`], never
//! silently empty.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid context or key
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value backend addressed by context path and key
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a value; `None` when absent
    async fn get(&self, contexts: &[String], key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a value
    async fn set(&self, contexts: &[String], key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove a value; absent keys are not an error
    async fn delete(&self, contexts: &[String], key: &str) -> Result<(), StorageError>;

    /// Keys stored directly under a context path
    async fn keys(&self, contexts: &[String]) -> Result<Vec<String>, StorageError>;
}

/// Flat key used by backends for a context path and key
pub fn storage_key(contexts: &[String], key: &str) -> Result<String, StorageError> {
    if contexts.is_empty() {
        return Err(StorageError::Invalid("context path must not be empty".into()));
    }
    validate_name(key)?;
    for context in contexts {
        validate_name(context)?;
    }
    Ok(format!("{}.{}", contexts.join("."), key))
}

/// Prefix shared by every flat key under a context path
pub fn context_prefix(contexts: &[String]) -> String {
    format!("{}.", contexts.join("."))
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains('.') {
        return Err(StorageError::Invalid(format!(
            "\"{}\" is not a valid context or key name",
            name
        )));
    }
    Ok(())
}

/// Typed view of one context path within a backend
#[derive(Clone)]
pub struct StorageContext {
    backend: Arc<dyn StorageBackend>,
    contexts: Vec<String>,
}

impl fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContext")
            .field("contexts", &self.contexts)
            .finish()
    }
}

impl StorageContext {
    /// Context path of this view
    pub fn path(&self) -> &[String] {
        &self.contexts
    }

    /// Nested context
    pub fn create_context(&self, name: &str) -> Result<StorageContext, StorageError> {
        validate_name(name)?;
        let mut contexts = self.contexts.clone();
        contexts.push(name.to_string());
        Ok(StorageContext {
            backend: self.backend.clone(),
            contexts,
        })
    }

    /// Read and deserialize a value
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.get(&self.contexts, key).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                StorageError::Corruption(format!(
                    "{}: undecodable value: {}",
                    context_prefix(&self.contexts) + key,
                    e
                ))
            }),
        }
    }

    /// Serialize and write a value
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        debug!("storage set {}{}", context_prefix(&self.contexts), key);
        self.backend.set(&self.contexts, key, value).await
    }

    /// Remove a value
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backend.delete(&self.contexts, key).await
    }

    /// Whether a key is present
    pub async fn contains(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.backend.get(&self.contexts, key).await?.is_some())
    }

    /// Keys directly under this context
    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.backend.keys(&self.contexts).await
    }
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// Single JSON file with checksum and atomic replace
    File {
        /// Path of the JSON file
        path: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::FileBackend;
pub use backend::mem::MemoryBackend;

/// Owner of the configured backend; hands out contexts
#[derive(Clone)]
pub struct StorageManager {
    backend: Arc<dyn StorageBackend>,
}

impl StorageManager {
    /// Wrap an existing backend
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Create storage from configuration
    pub async fn from_mode(mode: StorageMode) -> Result<Self, StorageError> {
        let backend: Arc<dyn StorageBackend> = match mode {
            StorageMode::InMemory => Arc::new(MemoryBackend::new()),
            StorageMode::File { path } => Arc::new(FileBackend::open(path).await?),
        };
        Ok(Self { backend })
    }

    /// Top-level context
    pub fn create_context(&self, name: &str) -> Result<StorageContext, StorageError> {
        validate_name(name)?;
        Ok(StorageContext {
            backend: self.backend.clone(),
            contexts: vec![name.to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Record {
        fabric_index: u8,
        label: String,
    }

    #[tokio::test]
    async fn test_typed_context_access() {
        let storage = StorageManager::from_mode(StorageMode::InMemory).await.unwrap();
        let ctx = storage.create_context("fabrics").unwrap();

        assert_eq!(ctx.get::<u8>("nextFabricIndex").await.unwrap(), None);
        ctx.set("nextFabricIndex", &3u8).await.unwrap();
        assert_eq!(ctx.get::<u8>("nextFabricIndex").await.unwrap(), Some(3));

        let record = Record {
            fabric_index: 1,
            label: "home".into(),
        };
        ctx.set("fabrics", &vec![record]).await.unwrap();
        let loaded: Vec<Record> = ctx.get("fabrics").await.unwrap().unwrap();
        assert_eq!(loaded[0].label, "home");

        let mut keys = ctx.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["fabrics", "nextFabricIndex"]);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_corruption() {
        let storage = StorageManager::from_mode(StorageMode::InMemory).await.unwrap();
        let ctx = storage.create_context("fabrics").unwrap();
        ctx.set("fabrics", &"not a list").await.unwrap();
        let err = ctx.get::<Vec<Record>>("fabrics").await.unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let storage = StorageManager::from_mode(StorageMode::InMemory).await.unwrap();
        let a = storage.create_context("a").unwrap();
        let nested = a.create_context("inner").unwrap();
        a.set("k", &1u32).await.unwrap();
        nested.set("k", &2u32).await.unwrap();

        assert_eq!(a.get::<u32>("k").await.unwrap(), Some(1));
        assert_eq!(nested.get::<u32>("k").await.unwrap(), Some(2));
        assert_eq!(a.keys().await.unwrap(), vec!["k"]);

        a.delete("k").await.unwrap();
        assert!(!a.contains("k").await.unwrap());
        assert!(nested.contains("k").await.unwrap());
    }

    #[test]
    fn test_storage_key_validation() {
        let ctx = vec!["fabrics".to_string()];
        assert_eq!(storage_key(&ctx, "x").unwrap(), "fabrics.x");
        assert!(storage_key(&ctx, "a.b").is_err());
        assert!(storage_key(&[], "x").is_err());
        assert!(storage_key(&ctx, "").is_err());
    }
}
