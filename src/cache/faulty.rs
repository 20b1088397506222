//! Storage wrapper that fails chosen operations, for tests.

use color_eyre::{eyre::eyre, Result};

use super::storage::SqliteStorage;
use super::traits::{CacheStorage, CachedEntry};
use crate::http::{Request, Response};

/// In-memory SQLite store with switchable failures.
pub struct FaultyStorage {
  /// The wrapped store, bypassing every failure
  pub inner: SqliteStorage,
  pub fail_lookup: bool,
  pub fail_put: bool,
  pub fail_keys: bool,
  /// Caches whose deletion fails
  pub undeletable: Vec<String>,
}

impl FaultyStorage {
  pub fn new() -> Self {
    Self {
      inner: SqliteStorage::open_in_memory().unwrap(),
      fail_lookup: false,
      fail_put: false,
      fail_keys: false,
      undeletable: Vec::new(),
    }
  }
}

impl CacheStorage for FaultyStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    self.inner.open(cache_name)
  }

  fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()> {
    if self.fail_put {
      return Err(eyre!("database is locked"));
    }
    self.inner.put(cache_name, request, response)
  }

  fn replace_all(&self, cache_name: &str, entries: &[(Request, Response)]) -> Result<()> {
    self.inner.replace_all(cache_name, entries)
  }

  fn lookup(&self, cache_name: &str, request: &Request) -> Result<Option<Response>> {
    if self.fail_lookup {
      return Err(eyre!("database disk image is malformed"));
    }
    self.inner.lookup(cache_name, request)
  }

  fn entries(&self, cache_name: &str) -> Result<Vec<CachedEntry>> {
    self.inner.entries(cache_name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    if self.fail_keys {
      return Err(eyre!("disk I/O error"));
    }
    self.inner.keys()
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    if self.undeletable.iter().any(|n| n == cache_name) {
      return Err(eyre!("disk I/O error"));
    }
    self.inner.delete(cache_name)
  }
}
