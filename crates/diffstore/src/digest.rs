//! Digest validation and on-disk naming.

use crate::error::{ErrorKind, Result};
use std::path::PathBuf;

/// Extension of raw and diff images.
pub const IMAGE_EXTENSION: &str = "png";

/// Check that `digest` is usable as a file name: non-empty ASCII
/// alphanumerics only.
///
/// ```
/// use diffcache_diffstore::validate_digest;
/// assert!(validate_digest("0a1b2c3d").is_ok());
/// assert!(validate_digest("../../etc/passwd").is_err());
/// ```
pub fn validate(digest: &str) -> Result<&str> {
    if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_alphanumeric()) {
        exn::bail!(ErrorKind::InvalidDigest(digest.to_string()));
    }
    Ok(digest)
}

/// File name of a raw image.
pub(crate) fn image_file_name(digest: &str) -> String {
    format!("{digest}.{IMAGE_EXTENSION}")
}

/// Sharded path of a raw image, relative to the images directory.
pub(crate) fn image_path(digest: &str) -> PathBuf {
    diffcache_storage::radix_path(&image_file_name(digest))
}

/// Strip the image extension off a requested file name.
pub(crate) fn strip_extension(file_name: &str) -> Option<&str> {
    file_name.strip_suffix(IMAGE_EXTENSION)?.strip_suffix('.')
}
