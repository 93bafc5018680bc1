//! Metrics Error Types

use derive_more::{Display, Error};

/// A metrics store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metrics store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Serialization/deserialization error.
    #[display("invalid metrics data")]
    InvalidData,
    #[display("invalid diff id: {_0}")]
    InvalidId(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // SQLITE_BUSY and friends surface as plain database errors.
        matches!(self, Self::Database)
    }
}
