//! Versioned request/response caches and the strategies that read them.
//!
//! This module provides:
//! - A storage capability keyed by cache name and request (method + URL)
//! - A SQLite-backed implementation that survives restarts
//! - Stale-while-revalidate and cache-first-with-refresh retrieval

#[cfg(test)]
pub mod faulty;
mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheSource, CacheStorage, CachedEntry};
