//! JSON file storage backend with checksum and atomic replace.
//!
//! The whole store lives in one file:
//!
//! ```text
//! { "version": 1, "crc32": <crc of data>, "data": { "<ctx>.<key>": <json>, ... } }
//! ```
//!
//! Every mutation rewrites `<file>.tmp`, fsyncs it and renames it over the
//! original, so a crash leaves either the old or the new content.

use crate::{context_prefix, storage_key, StorageBackend, StorageError};
use async_trait::async_trait;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    crc32: u32,
    data: BTreeMap<String, Value>,
}

fn compute_crc(data: &BTreeMap<String, Value>) -> Result<u32, StorageError> {
    let mut hasher = Hasher::new();
    hasher.update(&serde_json::to_vec(data)?);
    Ok(hasher.finalize())
}

/// File-backed store, loaded once and rewritten on every change
pub struct FileBackend {
    path: PathBuf,
    data: Mutex<BTreeMap<String, Value>>,
}

impl FileBackend {
    /// Open or create the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = Self::load(&path).await?;
        info!("Opened storage file {} with {} entries", path.display(), data.len());

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    async fn load(path: &Path) -> Result<BTreeMap<String, Value>, StorageError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let envelope: Envelope = serde_json::from_slice(&content).map_err(|e| {
            StorageError::Corruption(format!("Invalid storage file {}: {}", path.display(), e))
        })?;
        if envelope.version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported storage format version {}",
                envelope.version
            )));
        }
        let expected = compute_crc(&envelope.data)?;
        if envelope.crc32 != expected {
            return Err(StorageError::Corruption(format!(
                "Checksum mismatch in {}: stored {:08x}, computed {:08x}",
                path.display(),
                envelope.crc32,
                expected
            )));
        }
        Ok(envelope.data)
    }

    async fn flush(&self, data: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let envelope = Envelope {
            version: FORMAT_VERSION,
            crc32: compute_crc(data)?,
            data: data.clone(),
        };
        let content = serde_json::to_vec_pretty(&envelope)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!("Flushed {} bytes to {}", content.len(), self.path.display());
        Ok(())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, contexts: &[String], key: &str) -> Result<Option<Value>, StorageError> {
        let key = storage_key(contexts, key)?;
        Ok(self.data.lock().await.get(&key).cloned())
    }

    async fn set(&self, contexts: &[String], key: &str, value: Value) -> Result<(), StorageError> {
        let key = storage_key(contexts, key)?;
        let mut data = self.data.lock().await;
        let previous = data.insert(key.clone(), value);
        if let Err(e) = self.flush(&data).await {
            // Keep memory consistent with disk
            match previous {
                Some(previous) => data.insert(key, previous),
                None => data.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, contexts: &[String], key: &str) -> Result<(), StorageError> {
        let key = storage_key(contexts, key)?;
        let mut data = self.data.lock().await;
        if let Some(previous) = data.remove(&key) {
            if let Err(e) = self.flush(&data).await {
                data.insert(key, previous);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn keys(&self, contexts: &[String]) -> Result<Vec<String>, StorageError> {
        let prefix = context_prefix(contexts);
        Ok(self
            .data
            .lock()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('.'))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Vec<String> {
        vec!["fabrics".to_string()]
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path().join("store.json")).await.unwrap();
        assert!(backend.get(&ctx(), "fabrics").await.unwrap().is_none());
        assert!(backend.keys(&ctx()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        {
            let backend = FileBackend::open(&path).await.unwrap();
            backend.set(&ctx(), "nextFabricIndex", json!(4)).await.unwrap();
            backend.set(&ctx(), "fabrics", json!([{"fabricIndex": 3}])).await.unwrap();
            backend.delete(&ctx(), "missing").await.unwrap();
        }

        let backend = FileBackend::open(&path).await.unwrap();
        assert_eq!(backend.get(&ctx(), "nextFabricIndex").await.unwrap(), Some(json!(4)));
        assert_eq!(
            backend.get(&ctx(), "fabrics").await.unwrap(),
            Some(json!([{"fabricIndex": 3}]))
        );
        assert!(!dir.path().join("nested").join("store.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let backend = FileBackend::open(&path).await.unwrap();
            backend.set(&ctx(), "nextFabricIndex", json!(4)).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("4", "5")).unwrap();

        let err = FileBackend::open(&path).await.err().unwrap();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[tokio::test]
    async fn test_garbage_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileBackend::open(&path).await.err().unwrap();
        assert!(matches!(err, StorageError::Corruption(_)));
    }
}
