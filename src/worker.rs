//! The interception boundary: lifecycle signals plus per-request dispatch.

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::Config;
use crate::http::{Request, Response};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleManager, WorkerState};
use crate::network::Fetcher;
use crate::router::{Route, Router};
use crate::version::{CacheNames, REMOTE_DATA_HOST, SHELL_ASSETS};

pub type ClientId = u64;

/// Pages connected to the worker and the version controlling each one.
#[derive(Default)]
pub struct Clients {
  next_id: AtomicU64,
  controllers: Mutex<HashMap<ClientId, Option<String>>>,
}

impl Clients {
  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, Option<String>>> {
    self.controllers.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn connect(&self, controller: Option<&str>) -> ClientId {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.lock().insert(id, controller.map(String::from));
    id
  }

  pub fn disconnect(&self, id: ClientId) {
    self.lock().remove(&id);
  }

  pub fn controller(&self, id: ClientId) -> Option<String> {
    self.lock().get(&id).cloned().flatten()
  }

  /// Clients still controlled by a version other than `version`.
  pub fn controlled_by_other(&self, version: &str) -> usize {
    self
      .lock()
      .values()
      .filter(|c| matches!(c, Some(v) if v != version))
      .count()
  }

  /// Hand every connected client to `version`. Returns how many changed hands.
  pub fn claim(&self, version: &str) -> usize {
    let mut controllers = self.lock();
    let mut claimed = 0;
    for controller in controllers.values_mut() {
      if controller.as_deref() != Some(version) {
        *controller = Some(version.to_string());
        claimed += 1;
      }
    }
    claimed
  }
}

/// Request-handling service for one version.
///
/// Holds no per-request state; everything persistent lives in the injected
/// cache storage.
pub struct ServiceWorker {
  names: CacheNames,
  router: Router,
  layer: CacheLayer,
  lifecycle: LifecycleManager,
  clients: Clients,
}

impl ServiceWorker {
  /// `names` carries the build's version; the shell asset list and the
  /// reference-data host are build constants as well.
  pub fn new(
    config: &Config,
    names: CacheNames,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let app_url = config.app_url()?;

    Ok(Self {
      router: Router::new(&app_url, REMOTE_DATA_HOST),
      layer: CacheLayer::new(Arc::clone(&storage), Arc::clone(&fetcher)),
      lifecycle: LifecycleManager::new(
        storage,
        fetcher,
        names.clone(),
        app_url,
        SHELL_ASSETS.iter().map(|s| s.to_string()).collect(),
      ),
      names,
      clients: Clients::default(),
    })
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  /// See [`LifecycleManager::restore`].
  pub fn restore(&self) -> Result<bool> {
    self.lifecycle.restore()
  }

  /// Wait for background cache refreshes to land.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }

  pub async fn install(&self) -> Result<InstallReport> {
    self.lifecycle.install().await
  }

  /// Purge stale caches, then take over every connected client.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let report = self.lifecycle.activate().await?;
    let claimed = self.clients.claim(self.names.version());
    info!(
      version = self.names.version(),
      deleted = report.deleted.len(),
      claimed,
      "Activated"
    );
    Ok(report)
  }

  /// Bring the worker to `Active`, installing only if an earlier run has
  /// not already populated the shell cache.
  pub async fn start(&self) -> Result<Option<ActivateReport>> {
    if !self.lifecycle.restore()? {
      self.install().await?;
    }

    let others = self.clients.controlled_by_other(self.names.version());
    if !self.lifecycle.ready_to_activate(others) {
      debug!(others, "Waiting for clients of the previous version");
      return Ok(None);
    }

    self.activate().await.map(Some)
  }

  /// Register a page. Pages opened while a version is active are
  /// controlled by it straight away.
  pub fn connect(&self) -> ClientId {
    let controller = (self.state() == WorkerState::Active).then(|| self.names.version());
    self.clients.connect(controller)
  }

  /// Register a page that is still controlled by some earlier version.
  #[cfg(test)]
  pub fn connect_controlled_by(&self, version: &str) -> ClientId {
    self.clients.connect(Some(version))
  }

  pub fn disconnect(&self, client: ClientId) {
    self.clients.disconnect(client);
  }

  #[cfg(test)]
  pub fn controller(&self, client: ClientId) -> Option<String> {
    self.clients.controller(client)
  }

  /// Answer one request from `client`.
  ///
  /// Requests are only intercepted once this version is active and controls
  /// the client; anything else goes to the network untouched.
  pub async fn handle_fetch(
    &self,
    client: ClientId,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    let controlled = self.state() == WorkerState::Active
      && self.clients.controller(client).as_deref() == Some(self.names.version());

    if !controlled {
      debug!(url = %request.url, client, "Not controlled, passing through");
      return self.layer.network_only(request).await;
    }

    let route = self.router.route(request);
    debug!(url = %request.url, method = %request.method, ?route, "Routing request");

    let result = match route {
      Route::CacheFirst(ns) => {
        self
          .layer
          .cache_first_with_refresh(request, &self.names.name(ns))
          .await
      }
      Route::StaleWhileRevalidate(ns) => {
        self
          .layer
          .stale_while_revalidate(request, &self.names.name(ns))
          .await
      }
      Route::Network => self.layer.network_only(request).await,
    };

    if let Err(e) = &result {
      warn!(url = %request.url, error = %e, "Request failed");
    }
    result
  }
}
