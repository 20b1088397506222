//! Install and activate steps of a worker version.
//!
//! A version moves through `Installing -> Waiting -> Activating -> Active`.
//! Install fills the shell cache; activate purges every cache that belongs
//! to another version. A failed install leaves the version `Redundant`.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::http::{Request, Response};
use crate::network::Fetcher;
use crate::version::{CacheNames, Namespace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  /// Installed, not yet allowed to serve
  Waiting,
  Activating,
  Active,
  /// Install failed, this version will never serve
  Redundant,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Debug::fmt(self, f)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub cache_name: String,
  pub assets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  pub deleted: Vec<String>,
  /// Stale caches that could not be deleted
  pub failed: Vec<String>,
}

pub struct LifecycleManager {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  names: CacheNames,
  app_url: Url,
  shell_assets: Vec<String>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
}

impl LifecycleManager {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    names: CacheNames,
    app_url: Url,
    shell_assets: Vec<String>,
  ) -> Self {
    Self {
      storage,
      fetcher,
      names,
      app_url,
      shell_assets,
      state: Mutex::new(WorkerState::Installing),
      skip_waiting: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let previous = *current;
    debug!(from = %previous, to = %state, version = self.names.version(), "State change");
    *current = state;
  }

  /// Activate as soon as installed instead of waiting for old clients to go away.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Whether activation may proceed given how many clients still belong
  /// to another version.
  pub fn ready_to_activate(&self, clients_of_other_versions: usize) -> bool {
    self.skip_waiting.load(Ordering::SeqCst) || clients_of_other_versions == 0
  }

  /// Recognise a shell cache populated by an earlier run of this version.
  /// Returns true when install can be skipped.
  pub fn restore(&self) -> Result<bool> {
    if self.state() != WorkerState::Installing {
      return Ok(false);
    }

    let shell = self.names.name(Namespace::Shell);
    if !self.storage.keys()?.contains(&shell) {
      return Ok(false);
    }

    let entries = self.storage.entries(&shell)?;
    let expected = self.asset_requests()?;
    let complete = expected
      .iter()
      .all(|r| entries.iter().any(|e| e.request.cache_key() == r.cache_key()));

    if complete {
      info!(cache = %shell, "Shell cache already installed");
      self.skip_waiting();
      self.set_state(WorkerState::Waiting);
    }
    Ok(complete)
  }

  /// Pre-populate the shell cache with every shell asset.
  ///
  /// All assets are fetched before anything is written; a single failure
  /// fails the whole install and leaves the shell cache untouched.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_state(WorkerState::Installing);
    self.skip_waiting();

    match self.precache().await {
      Ok(report) => {
        info!(cache = %report.cache_name, assets = report.assets, "Installed");
        self.set_state(WorkerState::Waiting);
        Ok(report)
      }
      Err(e) => {
        warn!(version = self.names.version(), error = %e, "Install failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<InstallReport> {
    let cache_name = self.names.name(Namespace::Shell);
    self.storage.open(&cache_name)?;

    let requests = self.asset_requests()?;
    let fetches = requests.iter().map(|request| {
      let network = self.fetcher.fetch(request);
      async move {
        let response: Response = network.await?;
        if !response.is_ok() {
          return Err(eyre!(
            "Failed to precache {}: status {}",
            request.url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((request.clone(), response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.storage.replace_all(&cache_name, &entries)?;

    Ok(InstallReport {
      cache_name,
      assets: entries.len(),
    })
  }

  fn asset_requests(&self) -> Result<Vec<Request>> {
    self
      .shell_assets
      .iter()
      .map(|asset| {
        self
          .app_url
          .join(asset)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid shell asset '{}': {}", asset, e))
      })
      .collect()
  }

  /// Delete every cache not derived from the running version, then become active.
  ///
  /// Individual deletions are best effort. Failing to list caches at all
  /// returns the version to `Waiting`.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let state = self.state();
    if state != WorkerState::Waiting {
      return Err(eyre!(
        "Cannot activate {} while {}",
        self.names.version(),
        state
      ));
    }
    self.set_state(WorkerState::Activating);

    let keys = match self.storage.keys() {
      Ok(keys) => keys,
      Err(e) => {
        self.set_state(WorkerState::Waiting);
        return Err(e);
      }
    };

    let mut report = ActivateReport {
      deleted: Vec::new(),
      failed: Vec::new(),
    };

    for name in keys.into_iter().filter(|k| !self.names.is_current(k)) {
      match self.storage.delete(&name) {
        Ok(_) => {
          info!(cache = %name, "Deleted stale cache");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(cache = %name, error = %e, "Failed to delete stale cache");
          report.failed.push(name);
        }
      }
    }

    self.set_state(WorkerState::Active);
    Ok(report)
  }
}
