use super::ExternalStorage;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// A directory below the node's external-io-dir.
pub struct LocalStorage {
    uri: String,
    dir: PathBuf,
}

impl LocalStorage {
    /// `path` is the URI path; it must stay inside `root` after normalization.
    pub fn new(uri: &str, root: &Path, path: &str) -> Result<Self> {
        let relative = normalize(path).ok_or_else(|| EngineError::PathOutsideRoot(path.to_string()))?;
        Ok(Self {
            uri: uri.to_string(),
            dir: root.join(relative),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        let relative = normalize(name)
            .filter(|p| p.components().next().is_some())
            .ok_or_else(|| EngineError::PathOutsideRoot(name.to_string()))?;
        Ok(self.dir.join(relative))
    }
}

/// Resolves `.` and `..` lexically; `None` when the path climbs above its start.
fn normalize(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir | Component::RootDir => {}
            Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[async_trait]
impl ExternalStorage for LocalStorage {
    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &data).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.file_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EngineError::FileNotFound(format!(
                "{}/{}",
                self.uri.trim_end_matches('/'),
                name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.file_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.file_path(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn uri(&self) -> &str {
        &self.uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_keeps_paths_inside_root() {
        assert_eq!(normalize("/foo/bar"), Some(PathBuf::from("foo/bar")));
        assert_eq!(normalize("/foo/../bar/./baz"), Some(PathBuf::from("bar/baz")));
        assert_eq!(normalize("/foo/../../etc"), None);
        assert_eq!(normalize(".."), None);
    }

    #[test]
    fn test_escaping_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = LocalStorage::new("nodelocal:///../outside", dir.path(), "/../outside")
            .err()
            .unwrap();
        assert!(err.to_string().contains("outside of external-io-dir"));
    }

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new("nodelocal:///backups/a", dir.path(), "/backups/a").unwrap();

        storage.write_file("1.sst", b"one".to_vec()).await.unwrap();
        storage.write_file("2.sst", b"two".to_vec()).await.unwrap();
        storage.write_file("BACKUP", b"{}".to_vec()).await.unwrap();

        assert!(dir.path().join("backups/a/1.sst").exists());
        assert_eq!(storage.read_file("2.sst").await.unwrap(), b"two".to_vec());
        assert_eq!(storage.list("").await.unwrap(), vec!["1.sst", "2.sst", "BACKUP"]);
        assert_eq!(storage.list("BACK").await.unwrap(), vec!["BACKUP"]);

        storage.delete("1.sst").await.unwrap();
        storage.delete("1.sst").await.unwrap();
        assert!(!storage.exists("1.sst").await.unwrap());

        let err = storage.read_file("1.sst").await.unwrap_err();
        assert_eq!(err.kind(), "file_not_found");
        assert!(err.to_string().contains("no such file"));
    }

    #[tokio::test]
    async fn test_file_names_cannot_escape_destination() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new("nodelocal:///a", dir.path(), "/a").unwrap();
        assert!(storage.write_file("../../x", b"x".to_vec()).await.is_err());
        assert!(storage.read_file("").await.is_err());
    }
}
