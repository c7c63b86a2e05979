//! Durable object storage for materialized assets.
//!
//! `put(key, bytes, content_type) -> url`. Keys are relative, `/`-separated
//! paths; the returned URL is stable and owned by us.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Reject empty keys, absolute keys and any `..` segment.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object, and return
    /// the public URL.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str)
    -> Result<String, StorageError>;
}

/// Filesystem storage served under `public_base_url`.
///
/// Writes go to a temp file in the target directory, then `rename` into
/// place, so readers never see a partial object.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".tmp-{}", Uuid::now_v7()));
        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key, size = bytes.len(), "object stored");
        Ok(self.url_for(key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
}

/// In-memory storage for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStorage {
    pub const URL_PREFIX: &'static str = "memory://";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StorageError::Io("lock poisoned".to_string()))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{}{}", Self::URL_PREFIX, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cannot_escape_the_root() {
        for bad in ["", "/etc/passwd", "a/../b", "../x", "a//b", "a/./b", "a\\b"] {
            assert!(validate_key(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_key("generations/u/j.png").is_ok());
    }

    #[tokio::test]
    async fn fs_put_writes_file_and_returns_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path(), "https://cdn.example.com/media/");

        let url = storage
            .put("generations/u1/j1.png", Bytes::from_static(b"png-bytes"), "image/png")
            .await
            .unwrap();

        assert_eq!(url, "https://cdn.example.com/media/generations/u1/j1.png");
        let on_disk = std::fs::read(dir.path().join("generations/u1/j1.png")).unwrap();
        assert_eq!(on_disk, b"png-bytes");
    }

    #[tokio::test]
    async fn fs_put_replaces_existing_object_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path(), "/media");

        storage.put("k/a.bin", Bytes::from_static(b"one"), "application/octet-stream").await.unwrap();
        storage.put("k/a.bin", Bytes::from_static(b"two"), "application/octet-stream").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("k"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.bin".to_string()]);
        assert_eq!(std::fs::read(dir.path().join("k/a.bin")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn in_memory_put_keeps_content_type() {
        let storage = InMemoryObjectStorage::new();
        let url = storage.put("a/b.mp4", Bytes::from_static(b"v"), "video/mp4").await.unwrap();
        assert_eq!(url, "memory://a/b.mp4");
        assert_eq!(storage.get("a/b.mp4").unwrap().content_type, "video/mp4");
    }
}
