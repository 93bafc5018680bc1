//! Image diff caching engine.
//!
//! Given two image digests, produce a diff metric and a diff image, compute
//! each at most once, and keep the results around: in memory while there is
//! room, durably on disk forever.
//!
//! # Architecture
//!
//! ```text
//! DiffStore
//!     ├── ReadThroughCache<DiffMetrics>   // one computation per digest pair
//!     │       └── worker: MetricsStore → ImageLoader → DiffFn → persist
//!     ├── ImageLoader
//!     │       ├── ReadThroughCache<Image> // one fetch per digest
//!     │       ├── images/                 // sharded local mirror
//!     │       └── sources                 // remote blob stores, in order
//!     ├── diffs/                          // sharded diff images
//!     └── MetricsStore                    // SQLite, survives restarts
//! ```

mod diff;
mod digest;
pub mod error;
mod http;
mod loader;
mod sizing;
mod store;

pub use crate::diff::{DiffFn, default_diff_fn, pixel_diff};
pub use crate::digest::{IMAGE_EXTENSION, validate as validate_digest};
pub use crate::loader::{DigestFailure, Image, ImageLoader, Loaded};
pub use crate::sizing::cache_counts;
pub use crate::store::{
    DEFAULT_SOURCE_PREFIX, DIFFS_DIR, DiffStore, DiffStoreOptions, IMAGES_DIR, METRICS_DB, diff_image_file_name,
};
pub use diffcache_metrics::{DiffId, DiffMetrics};
pub use diffcache_rtcache::{PRIORITY_BACKGROUND, PRIORITY_NOW, Priority};
