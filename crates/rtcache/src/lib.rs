//! Read-through cache with per-key computation dedup.
//!
//! [`ReadThroughCache`] maps opaque string ids to values produced on demand
//! by a caller-supplied compute function. Misses are queued by
//! [`Priority`](priority::Priority) and executed by a fixed pool of worker
//! tasks; every caller asking for an id that is already being computed waits
//! on that single computation instead of starting another one.
//!
//! # Architecture
//!
//! ```text
//! ReadThroughCache
//!     ├── entries: DashMap<id, Cached>          // retained values, sharded locks
//!     ├── index: BTreeSet<(priority, seq, id)>  // eviction order
//!     ├── flights: DashMap<id, Flight>          // in-progress computations + waiters
//!     └── queue: BinaryHeap<Job>                // pending work, highest priority first
//! ```

mod cache;
pub mod error;
pub mod priority;

pub use crate::cache::ReadThroughCache;
pub use crate::priority::{PRIORITY_BACKGROUND, PRIORITY_NOW, Priority};
