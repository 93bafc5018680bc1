//! Blob store trait and implementations.
//!
//! This module defines the [`BlobStore`] trait: fetch-by-name and prefix
//! listing over a flat namespace of immutable, content-addressed blobs,
//! plus the write/delete operations needed to maintain a local mirror.

mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::local::LocalBlobStore;
#[cfg(feature = "mock")]
pub use self::mock::MockBlobStore;
use crate::error::Result;
use crate::models::BlobInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub(crate) type BlobInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<BlobInfo>> + Send + 'a>>;

/// Unified interface for blob stores.
///
/// All operations are asynchronous so that remote stores and the local disk
/// cache can be used interchangeably from async code.
///
/// # Path Handling
/// All paths are relative to the store root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use diffcache_storage::{backend::BlobStore, error::Result};
///
/// async fn fetch_if_present(store: &dyn BlobStore, name: &Path) -> Result<Option<Vec<u8>>> {
///     if store.exists(name).await? {
///         Ok(Some(store.read(name).await?))
///     } else {
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the configured store. Used for logging only.
    fn name(&self) -> &str;

    /// List all blobs matching an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`].
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<BlobInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream blob metadata matching an optional prefix.
    ///
    /// Prefixes are matched per path component: the prefix `dm-images-v1`
    /// matches `dm-images-v1/abc.png` but not `dm-images-v10/abc.png`.
    /// Listing a prefix that doesn't exist yields an empty stream, not an
    /// error.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use diffcache_storage::{backend::BlobStore, error::Result};
    /// # async fn example(store: &dyn BlobStore) -> Result<()> {
    /// let mut stream = store.list_stream(Some(Path::new("dm-images-v1")));
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.path.display(), info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a>;

    /// Check if a blob exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Fetch a blob's contents by name.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write a blob, creating or replacing it.
    ///
    /// # Notes
    /// - Implementations create parent directories as needed.
    /// - Readers never observe a partially written blob: the new contents
    ///   replace the old ones atomically. Content-addressed names mean two
    ///   concurrent writers of the same path write identical bytes, so the
    ///   last rename winning is always safe.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a blob.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the blob
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;
}
