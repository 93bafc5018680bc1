//! Local filesystem blob store.
//!
//! Used both as the on-disk image/diff cache and as a blob source that
//! mirrors a remote bucket into a local directory.

use crate::backend::BlobInfoStream;
use crate::error::ErrorKind;
use crate::{BlobInfo, BlobStore, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    File(BlobInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem blob store.
///
/// Stores blobs in a directory on the local filesystem. All paths are
/// relative to the configured root directory. Writes go through a temporary
/// file in the destination directory followed by a rename, so a crash or a
/// concurrent reader never sees a truncated file.
///
/// # Examples
///
/// ```no_run
/// use diffcache_storage::backend::LocalBlobStore;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let images = LocalBlobStore::new("images", "/var/lib/diffcache/images")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    name: String,
    root: PathBuf,
}
impl LocalBlobStore {
    /// Create a new local blob store, creating the root directory if it
    /// doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Get the absolute path for a relative storage path.
    pub fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Synchronous existence check that never leaves the local disk.
    ///
    /// Invalid paths are reported as absent.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.absolute_path(path).map(|abs| abs.is_file()).unwrap_or(false)
    }

    /// Convert an absolute path back to a relative storage path.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    fn metadata(path: &Path, metadata: Metadata) -> Result<BlobInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        Ok(BlobInfo::new(path, metadata.len(), UtcDateTime::from(modified)))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Descend into directories on the way to the prefix as well as
            // the ones beneath it.
            let on_the_way = prefix.is_none_or(|pfx| relative.starts_with(pfx) || pfx.starts_with(&relative));
            return Ok(if on_the_way { WalkEntry::Descend(path) } else { WalkEntry::Skip });
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            // Temporary files of in-progress writes are not blobs yet.
            if relative.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(TEMP_PREFIX)) {
                return Ok(WalkEntry::Skip);
            }
            return Ok(WalkEntry::File(Self::metadata(&relative, metadata)?));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

/// Prefix of the temporary files used for atomic writes.
const TEMP_PREFIX: &str = ".tmp";

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> BlobInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // A directory that doesn't exist is an empty listing.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        let Some(parent) = abs_path.parent().map(Path::to_path_buf) else {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        };
        fs::create_dir_all(&parent).await.map_err(|e| Self::map_io_error(e, path))?;
        let data = data.to_vec();
        let relative = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), ErrorKind> {
            let mut tmp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&parent)
                .map_err(|e| Self::map_io_error(e, &relative))?;
            tmp.write_all(&data).map_err(ErrorKind::Io)?;
            tmp.as_file().sync_all().map_err(ErrorKind::Io)?;
            tmp.persist(&abs_path).map_err(|e| Self::map_io_error(e.error, &relative))?;
            Ok(())
        })
        .await
        .or_raise(|| ErrorKind::BackendError("write task did not complete".to_string()))??;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }
}
