//! Content-addressed image loading.
//!
//! Raw images are fetched from an ordered list of blob sources, mirrored into
//! a sharded local directory and decoded to RGBA. Decoded images are kept in
//! a [`ReadThroughCache`], which also guarantees that concurrent requests for
//! one digest share a single fetch.

use crate::digest::{image_file_name, image_path, validate as validate_digest};
use crate::error::{ErrorKind, Result, from_cache};
use dashmap::DashMap;
use diffcache_rtcache::{Priority, ReadThroughCache};
use diffcache_storage::BlobHandle;
use diffcache_storage::backend::{BlobStore, LocalBlobStore};
use exn::ResultExt;
use image::{ImageFormat, RgbaImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

/// A decoded image, shared between the cache and its readers.
pub type Image = Arc<RgbaImage>;

/// The most recent failure to load a digest.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestFailure {
    pub digest: String,
    pub reason: ErrorKind,
    pub failed_at: UtcDateTime,
}

/// Outcome of loading a batch of digests.
#[derive(Debug)]
pub struct Loaded {
    /// One slot per requested digest, in request order. `None` where the
    /// digest failed.
    pub images: Vec<Option<Image>>,
    /// [`PartialFailure`](ErrorKind::PartialFailure) naming the failed
    /// digests, if any.
    pub failure: Option<crate::error::Error>,
}

impl Loaded {
    /// All images, or the batch failure if any digest failed.
    pub fn into_complete(self) -> Result<Vec<Image>> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        Ok(self.images.into_iter().flatten().collect())
    }
}

struct Inner {
    local: LocalBlobStore,
    sources: Vec<BlobHandle>,
    source_prefix: PathBuf,
    failures: DashMap<String, DigestFailure>,
}

/// Maps digests to decoded images through a local disk cache backed by
/// remote blob sources.
pub struct ImageLoader {
    inner: Arc<Inner>,
    cache: Arc<ReadThroughCache<Image, ErrorKind>>,
    tasks: TaskTracker,
    /// Serializes [`sync()`](Self::sync): the tracker is reopened after each drain.
    drain: Mutex<()>,
}

impl ImageLoader {
    /// Create a loader mirroring images into `local_dir`.
    ///
    /// `sources` are tried in order; raw images live under `source_prefix`
    /// in each of them. At most `capacity` decoded images stay in memory.
    pub fn new(
        local_dir: impl AsRef<Path>,
        sources: Vec<BlobHandle>,
        source_prefix: impl Into<PathBuf>,
        capacity: usize,
        parallelism: usize,
    ) -> Result<Self> {
        let local = LocalBlobStore::new("images", local_dir).or_raise(|| ErrorKind::Setup)?;
        let inner = Arc::new(Inner {
            local,
            sources,
            source_prefix: source_prefix.into(),
            failures: DashMap::new(),
        });
        let worker = Arc::clone(&inner);
        let cache = ReadThroughCache::new(
            move |_priority, digest: String| {
                let inner = Arc::clone(&worker);
                async move { inner.load(&digest).await }
            },
            capacity,
            parallelism,
        );
        Ok(Self { inner, cache: Arc::new(cache), tasks: TaskTracker::new(), drain: Mutex::new(()) })
    }

    /// Local disk cache the images are mirrored into.
    pub fn local(&self) -> &LocalBlobStore {
        &self.inner.local
    }

    /// Whether the raw image is in the local disk cache. Never touches a
    /// remote source.
    pub fn is_on_disk(&self, digest: &str) -> bool {
        validate_digest(digest).is_ok() && self.inner.local.contains(image_path(digest))
    }

    /// Load one decoded image per digest, in request order.
    ///
    /// Fails only if every digest fails. Otherwise the failed slots are
    /// `None` and [`Loaded::failure`] describes them.
    pub async fn get<S: AsRef<str>>(&self, priority: Priority, digests: &[S]) -> Result<Loaded> {
        let results = futures::future::join_all(
            digests.iter().map(|digest| async move { from_cache(self.cache.get(priority, digest.as_ref()).await) }),
        )
        .await;

        let mut images = Vec::with_capacity(digests.len());
        let mut failed = Vec::new();
        let mut last_error = None;
        for (digest, result) in digests.iter().zip(results) {
            match result {
                Ok(image) => images.push(Some(image)),
                Err(err) => {
                    tracing::warn!(digest = digest.as_ref(), error = ?err, "Unable to load image");
                    failed.push(digest.as_ref().to_string());
                    images.push(None);
                    last_error = Some(err);
                },
            }
        }
        match last_error {
            None => Ok(Loaded { images, failure: None }),
            // A single digest keeps its own error kind.
            Some(err) if digests.len() == 1 => Err(err),
            Some(_) if failed.len() == digests.len() => exn::bail!(ErrorKind::AllFailed(failed)),
            Some(_) => Ok(Loaded {
                images,
                failure: Some(exn::Exn::from(ErrorKind::PartialFailure(failed, digests.len()))),
            }),
        }
    }

    /// Load the digests in the background without handing back the images.
    /// Failures are logged.
    pub fn warm<S: AsRef<str>>(&self, priority: Priority, digests: &[S]) {
        for digest in digests {
            let digest = digest.as_ref().to_string();
            let cache = Arc::clone(&self.cache);
            self.tasks.spawn(async move {
                if let Err(err) = cache.warm(priority, &digest).await {
                    tracing::error!(%digest, error = ?err, "Unable to warm image");
                }
            });
        }
    }

    /// Wait until every warm-up started so far has finished. Concurrent
    /// callers drain one after the other.
    pub async fn sync(&self) {
        let _drain = self.drain.lock().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Digests whose most recent load failed.
    pub fn unavailable(&self) -> HashMap<String, DigestFailure> {
        self.inner.failures.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect()
    }

    /// Forget the digests: drop them from memory, the local disk cache and
    /// the failure records. With `purge_sources`, delete them from every
    /// blob source as well.
    pub async fn purge<S: AsRef<str>>(&self, digests: &[S], purge_sources: bool) -> Result<()> {
        self.cache.remove(digests);
        let mut failed = Vec::new();
        for digest in digests.iter().map(|digest| digest.as_ref()) {
            self.inner.failures.remove(digest);
            if validate_digest(digest).is_err() {
                continue;
            }
            if let Err(err) = delete_if_present(&self.inner.local, &image_path(digest)).await {
                tracing::error!(digest, error = ?err, "Unable to purge local image");
                failed.push(digest.to_string());
                continue;
            }
            if !purge_sources {
                continue;
            }
            let name = self.inner.source_prefix.join(image_file_name(digest));
            for source in &self.inner.sources {
                if let Err(err) = delete_if_present(&**source, &name).await {
                    tracing::error!(digest, source = source.name(), error = ?err, "Unable to purge image from source");
                    failed.push(digest.to_string());
                }
            }
        }
        if !failed.is_empty() {
            failed.dedup();
            exn::bail!(ErrorKind::batch(failed, digests.len()));
        }
        tracing::info!(count = digests.len(), purge_sources, "Purged digests");
        Ok(())
    }

    /// Stop accepting new loads. Images already retained can still be read.
    pub(crate) fn close(&self) {
        self.tasks.close();
        self.cache.close();
    }
}

async fn delete_if_present(store: &dyn BlobStore, path: &Path) -> diffcache_storage::error::Result<()> {
    match store.delete(path).await {
        Err(err) if err.is_not_found() => Ok(()),
        result => result,
    }
}

impl Inner {
    async fn load(&self, digest: &str) -> Result<Image> {
        validate_digest(digest)?;
        let result = self.load_or_fetch(digest).await;
        match &result {
            Ok(_) => {
                self.failures.remove(digest);
            },
            Err(err) if err.is_digest_failure() => {
                let failure = DigestFailure {
                    digest: digest.to_string(),
                    reason: (**err).clone(),
                    failed_at: UtcDateTime::now(),
                };
                self.failures.insert(digest.to_string(), failure);
            },
            Err(_) => {},
        }
        result
    }

    async fn load_or_fetch(&self, digest: &str) -> Result<Image> {
        let path = image_path(digest);
        if self.local.contains(&path) {
            match self.read_local(digest, &path).await {
                Ok(image) => return Ok(image),
                Err(err) => tracing::warn!(digest, error = ?err, "Refetching unreadable local image"),
            }
        }
        let bytes = self.fetch(digest).await?;
        // Decode before writing, so a corrupt blob never reaches the disk cache.
        let (image, bytes) = decode(digest, bytes).await?;
        if let Err(err) = self.local.write(&path, &bytes).await {
            // The decoded image still serves this request.
            tracing::error!(digest, error = ?err, "Unable to write image to local disk");
        }
        Ok(image)
    }

    async fn read_local(&self, digest: &str, path: &Path) -> Result<Image> {
        let bytes = self.local.read(path).await.or_raise(|| ErrorKind::Storage)?;
        match decode(digest, bytes).await {
            Ok((image, _)) => Ok(image),
            Err(err) => {
                tracing::warn!(digest, path = %path.display(), "Deleting corrupt local image");
                if let Err(err) = self.local.delete(path).await {
                    tracing::error!(digest, error = ?err, "Unable to delete corrupt local image");
                }
                Err(err)
            },
        }
    }

    async fn fetch(&self, digest: &str) -> Result<Vec<u8>> {
        let name = self.source_prefix.join(image_file_name(digest));
        let mut failed = None;
        for source in &self.sources {
            match source.read(&name).await {
                Ok(bytes) => {
                    tracing::debug!(digest, source = source.name(), size = bytes.len(), "Fetched image");
                    return Ok(bytes);
                },
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    tracing::warn!(digest, source = source.name(), error = ?err, "Blob source failed");
                    failed = Some(err);
                },
            }
        }
        match failed {
            // Somebody might still have it; it's not known to be missing.
            Some(err) => Err(err).or_raise(|| ErrorKind::Fetch(digest.to_string())),
            None => exn::bail!(ErrorKind::NotFound(digest.to_string())),
        }
    }
}

/// Decode PNG bytes off the async runtime, handing the bytes back.
async fn decode(digest: &str, bytes: Vec<u8>) -> Result<(Image, Vec<u8>)> {
    let (decoded, bytes) = tokio::task::spawn_blocking(move || {
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png).map(|image| image.to_rgba8());
        (decoded, bytes)
    })
    .await
    .or_raise(|| ErrorKind::Decode(digest.to_string()))?;
    let image = decoded.or_raise(|| ErrorKind::Decode(digest.to_string()))?;
    Ok((Arc::new(image), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::png;
    use diffcache_rtcache::PRIORITY_NOW;
    use diffcache_storage::backend::MockBlobStore;

    const PREFIX: &str = "dm-images-v1";

    fn source(blobs: &[(&str, Vec<u8>)]) -> Arc<MockBlobStore> {
        Arc::new(MockBlobStore::with_blobs(
            blobs.iter().map(|(digest, data)| (format!("{PREFIX}/{digest}.png"), data.clone())),
        ))
    }

    fn loader(dir: &Path, sources: &[Arc<MockBlobStore>], capacity: usize) -> ImageLoader {
        let sources = sources.iter().map(|s| Arc::clone(s) as BlobHandle).collect();
        ImageLoader::new(dir.join("images"), sources, PREFIX, capacity, 4).unwrap()
    }

    #[tokio::test]
    async fn test_fetches_then_serves_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("aaaa", png([255, 0, 0, 255], 3, 2))]);
        let images = loader(dir.path(), &[Arc::clone(&remote)], 0);
        assert!(!images.is_on_disk("aaaa"));

        let loaded = images.get(0, &["aaaa"]).await.unwrap().into_complete().unwrap();
        assert_eq!(loaded[0].dimensions(), (3, 2));
        assert!(images.is_on_disk("aaaa"));
        assert!(dir.path().join("images/aa/aa/aaaa.png").is_file());

        // Nothing retained in memory, but the disk copy saves a second fetch.
        images.get(0, &["aaaa"]).await.unwrap();
        assert_eq!(remote.reads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("bbbb", png([0, 0, 255, 255], 8, 8))]);
        let images = Arc::new(loader(dir.path(), &[Arc::clone(&remote)], 10));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let images = Arc::clone(&images);
                tokio::spawn(async move { images.get(PRIORITY_NOW, &["bbbb"]).await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().failure.is_none());
        }
        assert_eq!(remote.reads(), 1);
    }

    #[tokio::test]
    async fn test_sources_are_tried_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = source(&[]);
        let second = source(&[("cccc", png([0, 255, 0, 255], 1, 1))]);
        let images = loader(dir.path(), &[first, Arc::clone(&second)], 10);
        images.get(0, &["cccc"]).await.unwrap().into_complete().unwrap();
        assert_eq!(second.reads(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("aaaa", png([1, 2, 3, 255], 1, 1))]);
        let images = loader(dir.path(), &[remote], 10);

        let loaded = images.get(0, &["aaaa", "ffff"]).await.unwrap();
        assert!(loaded.images[0].is_some());
        assert!(loaded.images[1].is_none());
        let failure = loaded.failure.unwrap();
        assert_eq!(*failure, ErrorKind::PartialFailure(vec!["ffff".to_string()], 2));

        let unavailable = images.unavailable();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable["ffff"].reason, ErrorKind::NotFound("ffff".to_string()));
    }

    #[tokio::test]
    async fn test_all_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let images = loader(dir.path(), &[source(&[])], 10);
        let err = images.get(0, &["dddd"]).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound("dddd".to_string()));
        let err = images.get(0, &["dddd", "eeee"]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::AllFailed(failed) if failed.len() == 2));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("abab", b"definitely not a png".to_vec())]);
        let images = loader(dir.path(), &[remote], 10);
        let err = images.get(0, &["abab"]).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Decode("abab".to_string()));
        assert!(!images.is_on_disk("abab"));
        assert!(matches!(images.unavailable()["abab"].reason, ErrorKind::Decode(_)));
    }

    #[tokio::test]
    async fn test_corrupt_local_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("cdcd", png([9, 9, 9, 255], 2, 2))]);
        let images = loader(dir.path(), &[Arc::clone(&remote)], 0);
        images.local().write(&image_path("cdcd"), b"truncated").await.unwrap();

        let loaded = images.get(0, &["cdcd"]).await.unwrap().into_complete().unwrap();
        assert_eq!(loaded[0].dimensions(), (2, 2));
        assert_eq!(remote.reads(), 1);
        let on_disk = images.local().read(&image_path("cdcd")).await.unwrap();
        assert_eq!(on_disk, png([9, 9, 9, 255], 2, 2));
    }

    #[tokio::test]
    async fn test_success_clears_failure_record() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[]);
        let images = loader(dir.path(), &[Arc::clone(&remote)], 10);
        images.get(0, &["efef"]).await.unwrap_err();
        assert!(images.unavailable().contains_key("efef"));

        remote.write(Path::new("dm-images-v1/efef.png"), &png([0, 0, 0, 255], 1, 1)).await.unwrap();
        images.get(0, &["efef"]).await.unwrap();
        assert!(images.unavailable().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_digest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let images = loader(dir.path(), &[source(&[])], 10);
        let err = images.get(0, &["../../secret"]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidDigest(_)));
        assert!(!images.is_on_disk("../../secret"));
        assert!(images.unavailable().is_empty());
    }

    #[tokio::test]
    async fn test_warm_then_sync() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("1111", png([1, 1, 1, 255], 1, 1)), ("2222", png([2, 2, 2, 255], 1, 1))]);
        let images = loader(dir.path(), &[remote], 10);
        images.warm(0, &["1111", "2222", "3333"]);
        images.sync().await;
        assert!(images.is_on_disk("1111"));
        assert!(images.is_on_disk("2222"));
        assert!(images.unavailable().contains_key("3333"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_syncs_all_return() {
        let dir = tempfile::tempdir().unwrap();
        let images = loader(dir.path(), &[source(&[("1111", png([1, 1, 1, 255], 1, 1))])], 10);
        images.warm(0, &["1111"]);
        let syncs = futures::future::join_all((0..8).map(|_| images.sync()));
        tokio::time::timeout(std::time::Duration::from_secs(10), syncs).await.unwrap();
        assert!(images.is_on_disk("1111"));
    }

    #[tokio::test]
    async fn test_purge() {
        let dir = tempfile::tempdir().unwrap();
        let remote = source(&[("4444", png([4, 4, 4, 255], 1, 1))]);
        let images = loader(dir.path(), &[Arc::clone(&remote)], 10);
        images.get(0, &["4444"]).await.unwrap();

        images.purge(&["4444", "5555"], false).await.unwrap();
        assert!(!images.is_on_disk("4444"));
        assert!(remote.exists(Path::new("dm-images-v1/4444.png")).await.unwrap());

        images.purge(&["4444"], true).await.unwrap();
        assert!(!remote.exists(Path::new("dm-images-v1/4444.png")).await.unwrap());
        let err = images.get(0, &["4444"]).await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound("4444".to_string()));
    }
}
