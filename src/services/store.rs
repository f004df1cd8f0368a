//! Key/value persistence.
//!
//! Values are opaque strings (JSON documents written by the recovery
//! engine). [`FileStore`] keeps every key in one JSON file on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::error::{StoreError, StoreResult};

/// Durable key/value storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()>;
}

/// Process-local store, used by tests and embedders without a disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
        self.items.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Store backed by a single JSON file, rewritten atomically on every set.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store, reading the file if it exists.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let items = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Malformed {
                key: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Store file {} does not exist yet", path.display());
                BTreeMap::new()
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    async fn write_document(&self, items: &BTreeMap<String, String>) -> StoreResult<()> {
        let io_error = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let document = serde_json::to_string_pretty(items).map_err(|source| StoreError::Encode {
            key: self.path.display().to_string(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, document).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
        let mut items = self.items.lock().await;
        items.insert(key.to_string(), value);
        self.write_document(&items).await
    }
}
