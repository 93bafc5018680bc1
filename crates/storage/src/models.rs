//! Blob metadata returned by listings.

use std::path::PathBuf;
use time::UtcDateTime;

/// Metadata about a single blob, as returned by prefix listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Relative path from the store root
    pub path: PathBuf,
    /// Blob size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
}
impl BlobInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: impl Into<UtcDateTime>) -> Self {
        Self {
            path: path.into(),
            size,
            modified: modified.into(),
        }
    }

    /// File name of the blob without its directory.
    pub fn name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}
