//! Cache Module
//!
//! Provides the in-memory store, per-key entries and the public cache handle.

mod engine;
mod entry;
mod stats;
mod store;


// Re-export public types
pub use engine::Cache;
pub use entry::CacheEntry;
pub use stats::CacheStats;
pub use store::CacheStore;

pub(crate) use engine::Shared;
pub(crate) use entry::{DurationCalc, INITIAL_VERSION};
