use super::ExternalStorage;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared object map for one `mem://` bucket.
#[derive(Default)]
pub struct Bucket {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

pub struct MemoryStorage {
    uri: String,
    bucket: Arc<Bucket>,
    prefix: String,
}

impl MemoryStorage {
    pub fn new(uri: &str, bucket: Arc<Bucket>, prefix: &str) -> Self {
        Self {
            uri: uri.to_string(),
            bucket,
            prefix: prefix.to_string(),
        }
    }

    fn object_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

#[async_trait]
impl ExternalStorage for MemoryStorage {
    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<()> {
        self.bucket.objects.write().insert(self.object_name(name), data);
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.bucket
            .objects
            .read()
            .get(&self.object_name(name))
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound(format!("{}/{}", self.uri.trim_end_matches('/'), name)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full = self.object_name(prefix);
        let strip = self.object_name("");
        Ok(self
            .bucket
            .objects
            .read()
            .keys()
            .filter(|k| k.starts_with(&full))
            .filter_map(|k| k.strip_prefix(&strip))
            .filter(|k| !k.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.bucket.objects.write().remove(&self.object_name(name));
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.bucket.objects.read().contains_key(&self.object_name(name)))
    }

    fn uri(&self) -> &str {
        &self.uri
    }
}
