//! Diff Store Error Types
//!
//! Kinds are `Clone` because a failed image load or diff computation is
//! shared with every caller that was waiting on it.

use derive_more::{Display, Error};
use exn::ResultExt;

/// A diff store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for diff store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No blob source has the image.
    #[display("image not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// A blob source failed to answer.
    #[display("failed to fetch image: {_0}")]
    Fetch(#[error(not(source))] String),
    /// The image bytes are not a valid PNG.
    #[display("failed to decode image: {_0}")]
    Decode(#[error(not(source))] String),
    #[display("invalid digest: {_0:?}")]
    InvalidDigest(#[error(not(source))] String),
    /// Writing a result to local disk or the metrics store failed.
    #[display("failed to persist {_0}")]
    Persist(#[error(not(source))] String),
    /// Some, but not all, digests of a batch failed.
    #[display("{} of {_1} digests failed: {}", _0.len(), _0.join(", "))]
    PartialFailure(#[error(not(source))] Vec<String>, #[error(not(source))] usize),
    /// Every digest of a batch failed.
    #[display("all {} digests failed: {}", _0.len(), _0.join(", "))]
    AllFailed(#[error(not(source))] Vec<String>),
    #[display("failed to encode diff image")]
    Encode,
    /// The read-through cache was closed or its worker panicked.
    #[display("cache unavailable")]
    Cache,
    #[display("storage error")]
    Storage,
    #[display("failed to open diff store")]
    Setup,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Persist(_) | Self::Storage)
    }

    /// Failure of a batch of `total` items in which `failed` went wrong.
    pub(crate) fn batch(failed: Vec<String>, total: usize) -> Self {
        match failed.len() < total {
            true => Self::PartialFailure(failed, total),
            false => Self::AllFailed(failed),
        }
    }

    /// Whether this failure is worth remembering against the digest.
    pub(crate) fn is_digest_failure(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Fetch(_) | Self::Decode(_))
    }
}

/// Unwrap the compute error kind out of a read-through cache result.
pub(crate) fn from_cache<T>(result: diffcache_rtcache::error::Result<T, ErrorKind>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            let kind = err.compute().cloned().unwrap_or(ErrorKind::Cache);
            Err(err).or_raise(|| kind)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffcache_rtcache::error::{Error as CacheError, ErrorKind as CacheErrorKind};

    #[test]
    fn test_partial_failure_display() {
        let kind = ErrorKind::PartialFailure(vec!["aaaa".to_string(), "bbbb".to_string()], 3);
        assert_eq!(kind.to_string(), "2 of 3 digests failed: aaaa, bbbb");
    }

    #[test]
    fn test_batch_failure_kind() {
        let failed = vec!["aaaa".to_string(), "bbbb".to_string()];
        assert_eq!(ErrorKind::batch(failed.clone(), 3), ErrorKind::PartialFailure(failed.clone(), 3));
        assert_eq!(ErrorKind::batch(failed.clone(), 2), ErrorKind::AllFailed(failed));
        assert_eq!(ErrorKind::AllFailed(vec!["aaaa".to_string()]).to_string(), "all 1 digests failed: aaaa");
    }

    #[test]
    fn test_from_cache_keeps_compute_kind() {
        let failed = CacheError::from(CacheErrorKind::Compute(ErrorKind::NotFound("aaaa".to_string())));
        let err = from_cache::<()>(Err(failed)).unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound("aaaa".to_string()));

        let closed = CacheError::from(CacheErrorKind::Closed);
        assert_eq!(*from_cache::<()>(Err(closed)).unwrap_err(), ErrorKind::Cache);
    }
}
