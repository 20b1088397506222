//! Assigns each intercepted request to a retrieval strategy.

use url::{Origin, Url};

use crate::http::Request;
use crate::version::Namespace;

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Reference data: cache-first with background refresh
  CacheFirst(Namespace),
  /// First-party reads: stale-while-revalidate
  StaleWhileRevalidate(Namespace),
  /// Straight to the network, no caching
  Network,
}

/// Pure routing decision over method, host and origin. Performs no I/O.
#[derive(Debug, Clone)]
pub struct Router {
  app_origin: Origin,
  remote_data_host: String,
}

impl Router {
  pub fn new(app_url: &Url, remote_data_host: impl Into<String>) -> Self {
    Self {
      app_origin: app_url.origin(),
      remote_data_host: remote_data_host.into(),
    }
  }

  pub fn route(&self, request: &Request) -> Route {
    if request.host().as_deref() == Some(self.remote_data_host.as_str()) {
      return Route::CacheFirst(Namespace::RemoteData);
    }

    if request.is_read() && request.url.origin() == self.app_origin {
      return Route::StaleWhileRevalidate(Namespace::Shell);
    }

    Route::Network
  }
}
