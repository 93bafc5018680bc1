//! Diff metrics and their durable store.
//!
//! Diff metrics are expensive to compute (two image fetches, two decodes and a
//! full pixel comparison) but tiny to keep, so every computed result is
//! persisted here and survives restarts. The in-memory caches layered on top
//! are a disposable view over this store.
//!
//! # Architecture
//! - [`DiffId`]: canonical key for an unordered pair of distinct digests.
//! - [`DiffMetrics`]: the computed result, stored as JSON so that fields can
//!   be added without a schema migration.
//! - [`MetricsStore`]: SQLite database (one `metrics` table) holding
//!   `DiffId → DiffMetrics`.

pub mod error;
mod models;
mod store;

pub use crate::models::{COMBINED_METRIC, DiffId, DiffMetrics};
pub use crate::store::MetricsStore;
