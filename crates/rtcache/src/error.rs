//! Cache Error Types
//!
//! The cache is generic over the error kind `K` of its compute function. A
//! failed computation is observed by every caller that was waiting on it, so
//! the worker's kind is cloned into each caller's own error.

use std::error::Error as StdError;
use std::fmt;

/// A cache error with automatic location tracking.
pub type Error<K> = exn::Exn<ErrorKind<K>>;
/// Result type alias for cache operations.
pub type Result<T, K> = std::result::Result<T, Error<K>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind<K> {
    /// The compute function failed.
    Compute(K),
    /// The cache has been closed; no new computations are started.
    Closed,
    /// The compute function panicked.
    Panicked,
}

impl<K> ErrorKind<K> {
    /// The compute function's own error kind, if that's what failed.
    pub fn compute(&self) -> Option<&K> {
        match self {
            Self::Compute(kind) => Some(kind),
            _ => None,
        }
    }

    /// Returns `true` if retrying might succeed.
    ///
    /// Failed computations are never retained, so asking again always
    /// recomputes; only a closed cache is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl<K: fmt::Display> fmt::Display for ErrorKind<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute(kind) => write!(f, "computation failed: {kind}"),
            Self::Closed => f.write_str("cache is closed"),
            Self::Panicked => f.write_str("computation panicked"),
        }
    }
}

impl<K: StdError + 'static> StdError for ErrorKind<K> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Compute(kind) => Some(kind),
            _ => None,
        }
    }
}
