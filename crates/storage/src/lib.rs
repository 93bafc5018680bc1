//! Blob store boundary for diffcache.
//!
//! Raw images live in a remote blob store and are mirrored into a local,
//! content-addressed disk cache. Both sides speak the same [`BlobStore`]
//! trait, so the local cache, the remote sources and the in-memory test
//! double are interchangeable.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::BlobStore;
pub use crate::models::BlobInfo;
pub use crate::path::{radix as radix_path, validate as validate_path};
use std::sync::Arc;

pub type BlobHandle = Arc<dyn BlobStore + Send + Sync>;
