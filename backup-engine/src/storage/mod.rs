//! Blob storage for backup destinations.
//!
//! A destination is addressed by URI. `nodelocal:///path` resolves under the
//! node's external-io-dir; `mem://bucket/prefix` is process-local and used by
//! tests and the standalone server.

pub mod local;
pub mod memory;

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

#[async_trait]
pub trait ExternalStorage: Send + Sync {
    /// Writes `name` atomically, replacing any previous content.
    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<()>;

    /// Fails with `FileNotFound` when `name` is absent.
    async fn read_file(&self, name: &str) -> Result<Vec<u8>>;

    /// Names under this destination starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Removes `name`; deleting a missing file is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// URI this storage was opened from, for messages.
    fn uri(&self) -> &str;
}

const NODELOCAL_SCHEME: &str = "nodelocal://";
const MEMORY_SCHEME: &str = "mem://";

/// Resolves destination URIs to storage handles.
pub struct StorageFactory {
    external_io_dir: PathBuf,
    buckets: Mutex<HashMap<String, Arc<memory::Bucket>>>,
}

impl StorageFactory {
    pub fn new(external_io_dir: impl Into<PathBuf>) -> Self {
        Self {
            external_io_dir: external_io_dir.into(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn external_io_dir(&self) -> &std::path::Path {
        &self.external_io_dir
    }

    pub fn open(&self, uri: &str) -> Result<Arc<dyn ExternalStorage>> {
        if let Some(path) = uri.strip_prefix(NODELOCAL_SCHEME) {
            let storage = LocalStorage::new(uri, &self.external_io_dir, path)?;
            return Ok(Arc::new(storage));
        }
        if let Some(rest) = uri.strip_prefix(MEMORY_SCHEME) {
            let (bucket, prefix) = match rest.split_once('/') {
                Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(EngineError::UnsupportedStorage(uri.to_string()));
            }
            let bucket = self
                .buckets
                .lock()
                .entry(bucket.to_string())
                .or_default()
                .clone();
            return Ok(Arc::new(MemoryStorage::new(uri, bucket, prefix)));
        }
        Err(EngineError::UnsupportedStorage(uri.to_string()))
    }
}
