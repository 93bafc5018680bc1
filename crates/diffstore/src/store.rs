//! Diff metric orchestration.

use crate::diff::DiffFn;
use crate::error::{ErrorKind, Result, from_cache};
use crate::loader::{DigestFailure, Image, ImageLoader};
use crate::sizing::cache_counts;
use dashmap::DashMap;
use diffcache_metrics::{DiffId, DiffMetrics, MetricsStore};
use diffcache_rtcache::priority::combined;
use diffcache_rtcache::{PRIORITY_NOW, Priority, ReadThroughCache};
use diffcache_storage::backend::{BlobStore, LocalBlobStore};
use diffcache_storage::{BlobHandle, radix_path};
use exn::{OptionExt, ResultExt};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use image::{ImageFormat, RgbaImage};
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Raw images, relative to the base directory.
pub const IMAGES_DIR: &str = "images";
/// Diff images, relative to the base directory.
pub const DIFFS_DIR: &str = "diffs";
/// Metrics database file, relative to the base directory.
pub const METRICS_DB: &str = "diffstore.db";
/// Default directory holding raw images inside each blob source.
pub const DEFAULT_SOURCE_PREFIX: &str = "dm-images-v1";

/// How a [`DiffStore`] is laid out and sized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffStoreOptions {
    pub base_dir: PathBuf,
    pub source_prefix: String,
    /// Decoded images kept in memory.
    pub image_cache_size: usize,
    /// Diff metrics kept in memory.
    pub diff_cache_size: usize,
    /// Worker pool size of each cache.
    pub parallelism: usize,
}

impl DiffStoreOptions {
    /// Options for a store rooted at `base_dir`, sized for a 1 GiB budget.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            base_dir: base_dir.into(),
            source_prefix: DEFAULT_SOURCE_PREFIX.to_string(),
            image_cache_size: 0,
            diff_cache_size: 0,
            parallelism,
        }
        .with_cache_gigs(1)
    }

    /// Size both caches from a memory budget, see [`cache_counts()`].
    pub fn with_cache_gigs(mut self, gigs: u64) -> Self {
        (self.image_cache_size, self.diff_cache_size) = cache_counts(gigs);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.source_prefix = prefix.into();
        self
    }
}

struct Inner {
    loader: ImageLoader,
    diffs: LocalBlobStore,
    metrics: MetricsStore,
    diff_fn: DiffFn,
    tasks: TaskTracker,
    /// Encoded diff images handed to a background write that hasn't finished.
    unwritten: DashMap<String, Arc<Vec<u8>>>,
    /// Serializes [`DiffStore::sync()`]: the tracker is reopened after each drain.
    drain: Mutex<()>,
}

/// Computes, caches and persists diff metrics between images.
///
/// Every diff is computed at most once per process: concurrent requests for
/// one pair share a single computation, and the result is written to the
/// durable metrics store so it survives restarts. Cheap to clone; clones
/// share everything.
#[derive(Clone)]
pub struct DiffStore {
    inner: Arc<Inner>,
    cache: Arc<ReadThroughCache<DiffMetrics, ErrorKind>>,
    /// Writes diff images missing on disk, one writer per pair.
    backfills: Arc<ReadThroughCache<PathBuf, ErrorKind>>,
}

impl DiffStore {
    /// Open the store under `options.base_dir`, fetching raw images from
    /// `sources` (tried in order) and comparing them with `diff_fn`.
    #[instrument(skip_all, fields(base_dir = %options.base_dir.display()))]
    pub async fn open(options: DiffStoreOptions, sources: Vec<BlobHandle>, diff_fn: DiffFn) -> Result<Self> {
        let base_dir = &options.base_dir;
        let loader = ImageLoader::new(
            base_dir.join(IMAGES_DIR),
            sources,
            options.source_prefix.as_str(),
            options.image_cache_size,
            options.parallelism,
        )?;
        let diffs = LocalBlobStore::new("diffs", base_dir.join(DIFFS_DIR)).or_raise(|| ErrorKind::Setup)?;
        let metrics = MetricsStore::connect(base_dir.join(METRICS_DB)).await.or_raise(|| ErrorKind::Setup)?;
        let inner = Arc::new(Inner {
            loader,
            diffs,
            metrics,
            diff_fn,
            tasks: TaskTracker::new(),
            unwritten: DashMap::new(),
            drain: Mutex::new(()),
        });

        let worker = Arc::clone(&inner);
        let cache = Arc::new(ReadThroughCache::new(
            move |priority, id: String| Arc::clone(&worker).compute(priority, id),
            options.diff_cache_size,
            options.parallelism,
        ));
        let (worker, metrics_cache) = (Arc::clone(&inner), Arc::clone(&cache));
        // Paths are never retained; the cache only joins concurrent backfills.
        let backfills = ReadThroughCache::new(
            move |_priority, id: String| Arc::clone(&worker).backfill(Arc::clone(&metrics_cache), id),
            0,
            options.parallelism,
        );
        tracing::info!(
            images = options.image_cache_size,
            diffs = options.diff_cache_size,
            parallelism = options.parallelism,
            "Diff store opened",
        );
        Ok(Self { inner, cache, backfills: Arc::new(backfills) })
    }

    /// Make sure the raw images are on local disk. Returns immediately.
    pub fn warm_digests<S: AsRef<str>>(&self, priority: Priority, digests: &[S]) {
        let missing: Vec<&str> =
            digests.iter().map(|digest| digest.as_ref()).filter(|digest| !self.inner.loader.is_on_disk(digest)).collect();
        if !missing.is_empty() {
            self.inner.loader.warm(combined(priority), &missing);
        }
    }

    /// Compute the diff metrics of every distinct pair in `left × right` in
    /// the background. Returns immediately; see [`sync()`](Self::sync).
    ///
    /// `priority` is a class: warm-ups of the same class run most recent
    /// first.
    pub fn warm_diffs<S: AsRef<str>>(&self, priority: Priority, left: &[S], right: &[S]) {
        let priority = combined(priority);
        let ids: BTreeSet<DiffId> = left
            .iter()
            .flat_map(|l| right.iter().filter_map(move |r| DiffId::new(l.as_ref(), r.as_ref())))
            .collect();
        tracing::info!(count = ids.len(), "Warming diffs");
        for id in ids {
            let cache = Arc::clone(&self.cache);
            self.inner.tasks.spawn(async move {
                if let Err(err) = cache.warm(priority, id.as_str()).await {
                    tracing::error!(%id, error = ?err, "Unable to warm diff");
                }
            });
        }
    }

    /// Diff metrics of `main` against every candidate, keyed by candidate.
    ///
    /// Candidates equal to `main` are skipped. A candidate whose diff can't
    /// be computed is logged and left out; it never fails the whole call.
    pub async fn get<S: AsRef<str>>(
        &self,
        priority: Priority,
        main: &str,
        candidates: &[S],
    ) -> Result<HashMap<String, DiffMetrics>> {
        if main.is_empty() {
            exn::bail!(ErrorKind::InvalidDigest(main.to_string()));
        }
        let candidates: BTreeSet<&str> = candidates.iter().map(|candidate| candidate.as_ref()).collect();
        let mut pending: FuturesUnordered<_> = candidates
            .into_iter()
            .filter_map(|candidate| DiffId::new(main, candidate).map(|id| (candidate, id)))
            .map(|(candidate, id)| async move { (candidate, id.clone(), self.cache.get(priority, id.as_str()).await) })
            .collect();

        let mut found = HashMap::with_capacity(pending.len());
        while let Some((candidate, id, result)) = pending.next().await {
            match from_cache(result) {
                Ok(metrics) => {
                    found.insert(candidate.to_string(), metrics);
                },
                Err(err) => tracing::warn!(%id, error = ?err, "Unable to calculate diff"),
            }
        }
        Ok(found)
    }

    /// Wait until all background work started so far has finished: warm-ups
    /// and the asynchronous writes of computed results. Concurrent callers
    /// drain one after the other.
    pub async fn sync(&self) {
        let _drain = self.inner.drain.lock().await;
        self.inner.loader.sync().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Digests whose most recent load failed, with the reason.
    pub fn unavailable_digests(&self) -> HashMap<String, DigestFailure> {
        self.inner.loader.unavailable()
    }

    /// Forget raw images, see [`ImageLoader::purge()`].
    pub async fn purge_digests<S: AsRef<str>>(&self, digests: &[S], purge_sources: bool) -> Result<()> {
        self.inner.loader.purge(digests, purge_sources).await
    }

    /// Write the diff image of a pair to local disk unless it's already
    /// there, computing the diff right away if needed.
    ///
    /// Concurrent callers for one pair share a single backfill, and a diff
    /// that isn't known yet is computed through the metrics cache, so its
    /// metrics are cached and persisted like any other.
    pub(crate) async fn ensure_diff_image(&self, a: &str, b: &str) -> Result<PathBuf> {
        let id = DiffId::new(a, b).ok_or_raise(|| ErrorKind::InvalidDigest(a.to_string()))?;
        let path = radix_path(&id.diff_image_name());
        if self.inner.diffs.contains(&path) {
            return Ok(path);
        }
        from_cache(self.backfills.get(PRIORITY_NOW, id.as_str()).await)
    }

    pub(crate) fn loader(&self) -> &ImageLoader {
        &self.inner.loader
    }

    pub(crate) fn diffs(&self) -> &LocalBlobStore {
        &self.inner.diffs
    }

    /// Stop computing, drain background work and close the metrics store.
    pub async fn close(&self) {
        self.cache.close();
        self.backfills.close();
        self.inner.loader.close();
        self.sync().await;
        self.inner.metrics.close().await;
        tracing::info!("Diff store closed");
    }
}

impl Inner {
    /// Miss path of the diff metrics cache.
    async fn compute(self: Arc<Self>, priority: Priority, id: String) -> Result<DiffMetrics> {
        let id = id.parse::<DiffId>().or_raise(|| ErrorKind::InvalidDigest(id.clone()))?;
        match self.metrics.load(&id).await {
            Ok(Some(metrics)) => return Ok(metrics),
            Ok(None) => {},
            // Fall through and recompute; saving will overwrite the record.
            Err(err) => tracing::error!(%id, error = ?err, "Unable to load diff metrics"),
        }

        let (left, right) = id.digests();
        let images = self.loader.get(priority, &[left, right]).await?.into_complete()?;
        let (metrics, png) = self.diff_images(images).await?;
        self.save_async(id, metrics.clone(), png);
        Ok(metrics)
    }

    /// Miss path of the diff image backfill.
    async fn backfill(
        self: Arc<Self>,
        cache: Arc<ReadThroughCache<DiffMetrics, ErrorKind>>,
        id: String,
    ) -> Result<PathBuf> {
        let id = id.parse::<DiffId>().or_raise(|| ErrorKind::InvalidDigest(id.clone()))?;
        let path = radix_path(&id.diff_image_name());
        if self.diffs.contains(&path) {
            return Ok(path);
        }
        // Computes the diff unless it is already known.
        from_cache(cache.get(PRIORITY_NOW, id.as_str()).await)?;
        let unwritten = self.unwritten.get(id.as_str()).map(|png| Arc::clone(png.value()));
        let png = match unwritten {
            Some(png) => png,
            // The background write finished in the meantime.
            None if self.diffs.contains(&path) => return Ok(path),
            // Known diff whose image is gone: only the image is redrawn.
            None => {
                let (left, right) = id.digests();
                let images = self.loader.get(PRIORITY_NOW, &[left, right]).await?.into_complete()?;
                let (_, png) = self.diff_images(images).await?;
                tracing::debug!(%id, "Regenerated diff image");
                Arc::new(png)
            },
        };
        self.diffs.write(&path, &png).await.or_raise(|| ErrorKind::Persist(path.display().to_string()))?;
        Ok(path)
    }

    /// Run the diff function over a pair of images and encode the diff image.
    async fn diff_images(&self, images: Vec<Image>) -> Result<(DiffMetrics, Vec<u8>)> {
        let [left, right] = <[Image; 2]>::try_from(images)
            .map_err(|images| exn::Exn::from(ErrorKind::PartialFailure(Vec::new(), images.len())))?;
        let diff_fn = Arc::clone(&self.diff_fn);
        tokio::task::spawn_blocking(move || {
            let (metrics, diff_image) = diff_fn(&*left, &*right);
            encode_png(&diff_image).map(|png| (metrics, png))
        })
        .await
        .or_raise(|| ErrorKind::Encode)?
    }

    /// Persist a computed result. Failures are logged: the value is already
    /// on its way to the caller.
    fn save_async(self: &Arc<Self>, id: DiffId, metrics: DiffMetrics, png: Vec<u8>) {
        let inner = Arc::clone(self);
        let metrics_id = id.clone();
        self.tasks.spawn(async move {
            if let Err(err) = inner.metrics.save(&metrics_id, &metrics).await {
                tracing::error!(id = %metrics_id, error = ?err, "Unable to save diff metrics");
            }
        });
        let png = Arc::new(png);
        self.unwritten.insert(id.as_str().to_string(), Arc::clone(&png));
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let path = radix_path(&id.diff_image_name());
            if let Err(err) = inner.diffs.write(&path, &png).await {
                tracing::error!(%id, path = %path.display(), error = ?err, "Unable to save diff image");
            }
            inner.unwritten.remove_if(id.as_str(), |_, pending| Arc::ptr_eq(pending, &png));
        });
    }
}

fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).or_raise(|| ErrorKind::Encode)?;
    Ok(png)
}

/// Name of the diff image file of a pair, without its radix directories.
pub fn diff_image_file_name(a: &str, b: &str) -> Option<String> {
    DiffId::new(a, b).map(|id| id.diff_image_name())
}
