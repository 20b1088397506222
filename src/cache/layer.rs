//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{CacheResult, CacheStorage};
use crate::http::{Request, Response};
use crate::network::Fetcher;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the router and the network, serving stored
/// responses when it can and refreshing them in the background.
#[derive(Clone)]
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  /// Background refreshes not yet known to be finished
  in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CacheLayer {
  pub fn new(storage: Arc<dyn CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      storage,
      fetcher,
      in_flight: Arc::default(),
    }
  }

  /// Stale-while-revalidate.
  ///
  /// 1. Look up the stored entry
  /// 2. Start a network fetch regardless, storing any 200 response
  /// 3. Return the stored entry immediately if there is one
  /// 4. Otherwise wait for the network and surface its failure
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    cache_name: &str,
  ) -> Result<CacheResult<Response>> {
    let cached = self.cached(request, cache_name);
    let network = self.revalidate(request, cache_name);

    if let Some(response) = cached {
      debug!(url = %request.url, cache = cache_name, "Serving cached entry, revalidating");
      return Ok(CacheResult::from_cache(response));
    }

    let response = join(network).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Cache-first with background refresh.
  ///
  /// Same as stale-while-revalidate, except that a miss combined with a
  /// network failure yields a synthetic 504 instead of an error.
  pub async fn cache_first_with_refresh(
    &self,
    request: &Request,
    cache_name: &str,
  ) -> Result<CacheResult<Response>> {
    let cached = self.cached(request, cache_name);
    let network = self.revalidate(request, cache_name);

    if let Some(response) = cached {
      debug!(url = %request.url, cache = cache_name, "Serving cached entry, refreshing");
      return Ok(CacheResult::from_cache(response));
    }

    match join(network).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(e) => {
        warn!(url = %request.url, error = %e, "No cached entry and network failed");
        Ok(CacheResult::unavailable(Response::unavailable()))
      }
    }
  }

  /// Plain network fetch, nothing is read or stored.
  pub async fn network_only(&self, request: &Request) -> Result<CacheResult<Response>> {
    let response = self.fetcher.fetch(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Stored entry for `request`. A failing store counts as a miss.
  fn cached(&self, request: &Request, cache_name: &str) -> Option<Response> {
    let lookup = self
      .storage
      .open(cache_name)
      .and_then(|_| self.storage.lookup(cache_name, request));

    match lookup {
      Ok(found) => found,
      Err(e) => {
        warn!(url = %request.url, cache = cache_name, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Fetch from the network in a background task and store a 200 response.
  ///
  /// The task keeps running when the receiver is dropped, so the store lands
  /// even after the caller has been answered from the cache.
  fn revalidate(
    &self,
    request: &Request,
    cache_name: &str,
  ) -> oneshot::Receiver<Result<Response>> {
    let (tx, rx) = oneshot::channel();
    let storage = Arc::clone(&self.storage);
    let network = self.fetcher.fetch(request);
    let request = request.clone();
    let cache_name = cache_name.to_string();

    let handle = tokio::spawn(async move {
      let result = network.await.inspect(|response| {
        if response.is_ok() {
          match storage.put(&cache_name, &request, response) {
            Ok(()) => debug!(url = %request.url, cache = %cache_name, "Stored fresh response"),
            Err(e) => {
              warn!(url = %request.url, cache = %cache_name, error = %e, "Failed to store response")
            }
          }
        }
      });
      // Ignore send errors - the caller may already have its answer
      let _ = tx.send(result);
    });

    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    in_flight.retain(|h| !h.is_finished());
    in_flight.push(handle);

    rx
  }

  /// Wait for every background refresh started so far.
  pub async fn settle(&self) {
    let handles = {
      let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
      std::mem::take(&mut *in_flight)
    };
    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Background refresh panicked");
      }
    }
  }
}

async fn join(network: oneshot::Receiver<Result<Response>>) -> Result<Response> {
  network
    .await
    .map_err(|_| eyre!("Network task was dropped before answering"))?
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::faulty::FaultyStorage;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::network::stub::StubFetcher;
  use std::time::Duration;

  const INDEX: &str = "http://localhost:8080/index.html";
  const VERSIONS: &str = "https://ddragon.leagueoflegends.com/api/versions.json";

  fn setup() -> (Arc<SqliteStorage>, Arc<StubFetcher>, CacheLayer) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(StubFetcher::new());
    let layer = CacheLayer::new(storage.clone(), fetcher.clone());
    (storage, fetcher, layer)
  }

  fn get(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  #[tokio::test]
  async fn test_swr_hit_does_not_wait_for_network() {
    let (storage, fetcher, layer) = setup();
    let request = get(INDEX);
    storage
      .put("shell-v1", &request, &Response::new(200, "cached"))
      .unwrap();
    fetcher.hang(INDEX);

    let result = tokio::time::timeout(
      Duration::from_millis(200),
      layer.stale_while_revalidate(&request, "shell-v1"),
    )
    .await
    .expect("cached entry should be returned without waiting")
    .unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached".to_vec());
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_swr_hit_with_failing_network_returns_cached() {
    let (storage, fetcher, layer) = setup();
    let request = get(INDEX);
    storage
      .put("shell-v1", &request, &Response::new(200, "cached"))
      .unwrap();
    fetcher.fail(INDEX);

    let result = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();
    layer.settle().await;

    assert_eq!(result.data.body, b"cached".to_vec());
    assert_eq!(
      storage.lookup("shell-v1", &request).unwrap().unwrap().body,
      b"cached".to_vec()
    );
  }

  #[tokio::test]
  async fn test_swr_hit_refreshes_for_next_request() {
    let (storage, fetcher, layer) = setup();
    let request = get(INDEX);
    storage
      .put("shell-v1", &request, &Response::new(200, "old"))
      .unwrap();
    fetcher.respond(INDEX, Response::new(200, "new"));

    let first = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();
    assert_eq!(first.data.body, b"old".to_vec());

    layer.settle().await;
    let second = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();
    assert_eq!(second.data.body, b"new".to_vec());
  }

  #[tokio::test]
  async fn test_swr_miss_waits_for_network_and_stores() {
    let (storage, fetcher, layer) = setup();
    let request = get(INDEX);
    fetcher.respond(INDEX, Response::new(200, "fresh"));

    let result = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh".to_vec());
    assert_eq!(
      storage.lookup("shell-v1", &request).unwrap(),
      Some(Response::new(200, "fresh"))
    );
  }

  #[tokio::test]
  async fn test_swr_miss_with_failing_network_surfaces_error() {
    let (_storage, fetcher, layer) = setup();
    fetcher.fail(INDEX);

    let result = layer.stale_while_revalidate(&get(INDEX), "shell-v1").await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_non_200_is_returned_but_not_stored() {
    let (storage, fetcher, layer) = setup();
    let request = get(INDEX);
    fetcher.respond(INDEX, Response::new(404, "missing"));

    let result = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();

    assert_eq!(result.data.status, 404);
    assert_eq!(storage.lookup("shell-v1", &request).unwrap(), None);
  }

  #[tokio::test]
  async fn test_cache_first_miss_and_offline_yields_504() {
    let (_storage, fetcher, layer) = setup();
    fetcher.fail(VERSIONS);

    let result = layer
      .cache_first_with_refresh(&get(VERSIONS), "ddragon-v1")
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Unavailable);
    assert_eq!(result.data.status, 504);
    assert!(result.data.body.is_empty());
  }

  #[tokio::test]
  async fn test_cache_first_hit_refreshes_in_background() {
    let (storage, fetcher, layer) = setup();
    let request = get(VERSIONS);
    storage
      .put("ddragon-v1", &request, &Response::new(200, r#"["14.1.1"]"#))
      .unwrap();
    fetcher.respond(VERSIONS, Response::new(200, r#"["14.2.1"]"#));

    let result = layer
      .cache_first_with_refresh(&request, "ddragon-v1")
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, br#"["14.1.1"]"#.to_vec());

    layer.settle().await;
    assert_eq!(
      storage.lookup("ddragon-v1", &request).unwrap().unwrap().body,
      br#"["14.2.1"]"#.to_vec()
    );
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let (storage, fetcher, layer) = setup();
    let request = get(VERSIONS);
    fetcher.respond(VERSIONS, Response::new(200, "[]"));

    let result = layer
      .cache_first_with_refresh(&request, "ddragon-v1")
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(storage.lookup("ddragon-v1", &request).unwrap().is_some());
    assert_eq!(storage.keys().unwrap(), vec!["ddragon-v1"]);
  }

  #[tokio::test]
  async fn test_failed_lookup_counts_as_miss() {
    let storage = Arc::new(FaultyStorage {
      fail_lookup: true,
      ..FaultyStorage::new()
    });
    let fetcher = Arc::new(StubFetcher::new());
    let layer = CacheLayer::new(storage.clone(), fetcher.clone());
    let request = get(INDEX);
    storage
      .inner
      .put("shell-v1", &request, &Response::new(200, "cached"))
      .unwrap();
    fetcher.respond(INDEX, Response::new(200, "fresh"));

    let result = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh".to_vec());

    fetcher.fail(VERSIONS);
    let result = layer
      .cache_first_with_refresh(&get(VERSIONS), "ddragon-v1")
      .await
      .unwrap();
    assert_eq!(result.data.status, 504);
  }

  #[tokio::test]
  async fn test_failed_store_is_not_surfaced() {
    let storage = Arc::new(FaultyStorage {
      fail_put: true,
      ..FaultyStorage::new()
    });
    let fetcher = Arc::new(StubFetcher::new());
    let layer = CacheLayer::new(storage.clone(), fetcher.clone());
    let request = get(INDEX);
    fetcher.respond(INDEX, Response::new(200, "fresh"));

    let result = layer
      .stale_while_revalidate(&request, "shell-v1")
      .await
      .unwrap();
    layer.settle().await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh".to_vec());
    assert_eq!(storage.inner.lookup("shell-v1", &request).unwrap(), None);
  }

  #[tokio::test]
  async fn test_network_only_bypasses_cache() {
    let (storage, fetcher, layer) = setup();
    let url = "https://cdn.example.com/lib.js";
    fetcher.respond(url, Response::new(200, "lib"));

    let result = layer.network_only(&get(url)).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(storage.keys().unwrap().is_empty());
  }
}
