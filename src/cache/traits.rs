//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{Request, Response};

/// Persistent store of named caches, each mapping requests to their last
/// stored response.
///
/// Entries are matched by method + URL (query string significant). Every
/// write is a full overwrite of one key; there is no partial update.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Store a response, replacing any previous entry for the same request.
  /// Creates the cache if needed.
  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Atomically replace the whole content of a cache with `entries`.
  fn replace_all(&self, cache_name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Most recently stored response for `request`, if any.
  fn lookup(&self, cache_name: &str, request: &Request) -> Result<Option<Response>>;

  /// Entries of a cache, oldest write first.
  fn entries(&self, cache_name: &str) -> Result<Vec<CachedEntry>>;

  /// Names of all existing caches in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a cache and everything in it. Returns whether it existed.
  fn delete(&self, cache_name: &str) -> Result<bool>;
}

/// Summary of one stored entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub request: Request,
  pub status: u16,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }

  pub fn unavailable(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Unavailable,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Straight from the network
  Network,
  /// Stored entry; a refresh may still be running in the background
  Cache,
  /// Neither cache nor network could answer, response is synthetic
  Unavailable,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Unavailable => "unavailable",
    };
    f.write_str(label)
  }
}
