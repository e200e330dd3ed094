//! Background Tasks Module
//!
//! Contains the tokio tasks that run behind a cache.
//!
//! # Tasks
//! - Refresh scheduler: arms refresh timers and runs fetches
//! - TTL expiry: removes entries once their time-to-live elapses

pub(crate) mod expiry;
pub(crate) mod scheduler;
