//! Refresh Cache - An in-process cache that keeps itself fresh
//!
//! Stores values with optional TTL expiry and re-fetches them ahead of time
//! on a schedule computed from the last fetched value.

pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
mod tasks;

pub use cache::{Cache, CacheStats};
pub use config::{Config, RateLimitConfig};
pub use error::{CacheError, Result};
pub use limiter::RateLimiter;
