//! In-memory blob store for testing.

use super::BlobInfoStream;
use crate::error::{ErrorKind, Result};
use crate::models::BlobInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use time::UtcDateTime;
use tokio::sync::RwLock;

use crate::BlobStore;

/// In-memory blob store for testing.
///
/// Blobs are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// operate on `&self` without external synchronisation. Every successful
/// [`read()`](BlobStore::read) is counted, which lets tests assert how many
/// times a blob was actually fetched.
///
/// # Examples
///
/// ```
/// use diffcache_storage::backend::{BlobStore, MockBlobStore};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockBlobStore::with_blobs([
///     ("dm-images-v1/abcdef.png", b"not really a png"),
/// ]);
/// assert!(store.exists(Path::new("dm-images-v1/abcdef.png")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBlobStore {
    storage: RwLock<HashMap<PathBuf, (UtcDateTime, Vec<u8>)>>,
    reads: AtomicUsize,
}

impl MockBlobStore {
    /// Create a mock store pre-populated with blobs.
    ///
    /// Panics if any path fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_blobs(blobs: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in blobs {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBlobStore::with_blobs: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            storage: RwLock::new(map),
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of successful reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}
impl Default for MockBlobStore {
    fn default() -> Self {
        let blobs: [(&str, &str); 0] = [];
        Self::with_blobs(blobs)
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    fn name(&self) -> &str {
        "mock"
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot under the read lock, then drop it before yielding.
            let entries: Vec<(PathBuf, UtcDateTime, u64)> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| validated_prefix.as_ref().is_none_or(|pfx| path.starts_with(pfx)))
                    .map(|(path, (inserted, data))| (path.clone(), *inserted, data.len() as u64))
                    .collect()
            };
            for (path, inserted, size) in entries {
                yield Ok(BlobInfo::new(path, size, inserted));
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let (_inserted, data) =
            self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.insert(path, (UtcDateTime::now(), data.to_vec()));
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read() {
        let store = MockBlobStore::default();
        store.write(Path::new("abcdef.png"), b"hello").await.unwrap();
        assert_eq!(store.read(Path::new("abcdef.png")).await.unwrap(), b"hello");
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let store = MockBlobStore::default();
        let err = store.read(Path::new("missing.png")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MockBlobStore::with_blobs([("a.png", Vec::from(*b"a"))]);
        store.delete(Path::new("a.png")).await.unwrap();
        assert!(!store.exists(Path::new("a.png")).await.unwrap());
        let err = store.delete(Path::new("a.png")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let store = MockBlobStore::with_blobs([
            ("dm-images-v1/aaaa.png", Vec::from(*b"a")),
            ("dm-images-v1/bbbb.png", Vec::from(*b"b")),
            ("dm-images-v10/cccc.png", Vec::from(*b"c")),
        ]);
        let files = store.list(Some(Path::new("dm-images-v1"))).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let store = MockBlobStore::default();
        assert!(store.read(Path::new("../etc/passwd")).await.is_err());
        assert!(store.write(Path::new("../escape"), b"bad").await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_blobs_panics_on_bad_path() {
        MockBlobStore::with_blobs([("../escape", Vec::from(*b"bad"))]);
    }
}
