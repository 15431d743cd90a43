//! Object-storage backend abstraction.
//!
//! Manifest documents and the ingest allow-list live in object storage. The
//! cloud SDK sits behind this trait; granary itself only needs whole-object
//! get/put/delete plus the public URL the warehouse's bulk loader will be
//! handed. The memory backend backs the test suites, the filesystem backend
//! backs local development.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Storage backend trait for whole-object access.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes an object, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deletes an object. Idempotent: succeeds if the object is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// The externally resolvable URL for an object under this backend.
    ///
    /// This is the URL embedded in `COPY ... FROM '<url>'`; for the real
    /// deployment it is an `s3://bucket/key` location.
    fn url_for(&self, key: &str) -> String;
}

/// Builds a storage backend from a location string.
///
/// `mem://<name>` yields an in-memory backend, anything else is treated as
/// a filesystem root (with an optional `file://` prefix). The S3 client is
/// deliberately not constructed here; deployments wire their own
/// [`StorageBackend`] implementation around the cloud SDK.
pub fn backend_from_location(location: &str) -> Result<Arc<dyn StorageBackend>> {
    if let Some(name) = location.strip_prefix("mem://") {
        return Ok(Arc::new(MemoryBackend::named(name)));
    }
    let root = location.strip_prefix("file://").unwrap_or(location);
    if root.is_empty() {
        return Err(Error::Config(format!(
            "unusable storage location {location:?}"
        )));
    }
    Ok(Arc::new(FsBackend::new(root)))
}

/// In-memory storage backend for testing.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::named("granary")
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a memory backend whose URLs use the given bucket name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored objects. Test helper.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Whether the backend holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("storage lock poisoned"))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object not found: {key}")))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::internal("storage lock poisoned"))?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::internal("storage lock poisoned"))?
            .remove(key);
        Ok(())
    }

    fn url_for(&self, key: &str) -> String {
        format!("mem://{}/{key}", self.name)
    }
}

/// Filesystem-rooted storage backend for local development.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily
    /// on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn get(&self, key: &str) -> Result<Bytes> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {key}")))
            }
            Err(e) => Err(Error::storage_with_source(format!("reading {key}"), e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage_with_source(format!("creating dir for {key}"), e))?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::storage_with_source(format!("writing {key}"), e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(format!("deleting {key}"), e)),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        backend
            .put("manifests/abc", Bytes::from("hello"))
            .await
            .expect("put should succeed");

        let data = backend.get("manifests/abc").await.expect("get");
        assert_eq!(data, Bytes::from("hello"));

        backend.delete("manifests/abc").await.expect("delete");
        assert!(matches!(
            backend.get("manifests/abc").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.delete("never-existed").await.expect("delete");
    }

    #[test]
    fn memory_urls_carry_bucket_name() {
        let backend = MemoryBackend::named("manifests");
        assert_eq!(backend.url_for("a/b"), "mem://manifests/a/b");
    }

    #[tokio::test]
    async fn fs_backend_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(dir.path());

        backend
            .put("nested/key.json", Bytes::from("{}"))
            .await
            .expect("put");
        let data = backend.get("nested/key.json").await.expect("get");
        assert_eq!(data, Bytes::from("{}"));

        backend.delete("nested/key.json").await.expect("delete");
        assert!(matches!(
            backend.get("nested/key.json").await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn backend_from_location_dispatches() {
        assert!(backend_from_location("mem://test").is_ok());
        assert!(backend_from_location("file:///tmp/granary").is_ok());
        assert!(backend_from_location("/tmp/granary").is_ok());
        assert!(backend_from_location("").is_err());
    }
}
