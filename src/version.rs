//! Version identity and the cache names derived from it.
//!
//! Bumping the version is the only way old caches get invalidated: on
//! activation every cache whose name is not derived from the running
//! version is deleted.

/// Version of the cached asset set shipped with this build.
pub const SW_VERSION: &str = "v1.0.4";

/// Shell assets that must be available offline right after install,
/// relative to the application URL.
pub const SHELL_ASSETS: &[&str] = &[
  "./", // if hosted at domain root
  "./index.html",
];

/// Host serving the reference data (versions.json, champion.json, icons).
pub const REMOTE_DATA_HOST: &str = "ddragon.leagueoflegends.com";

/// The two compartments requests are cached into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
  /// First-party application assets
  Shell,
  /// Third-party reference data (Data Dragon)
  RemoteData,
}

impl Namespace {
  pub const ALL: [Namespace; 2] = [Namespace::Shell, Namespace::RemoteData];

  pub fn prefix(self) -> &'static str {
    match self {
      Namespace::Shell => "shell",
      Namespace::RemoteData => "ddragon",
    }
  }
}

/// Cache names for one running version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  version: String,
}

impl CacheNames {
  pub fn new(version: impl Into<String>) -> Self {
    Self {
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, namespace: Namespace) -> String {
    format!("{}-{}", namespace.prefix(), self.version)
  }

  pub fn current(&self) -> Vec<String> {
    Namespace::ALL.iter().map(|ns| self.name(*ns)).collect()
  }

  pub fn is_current(&self, cache_name: &str) -> bool {
    self.current().iter().any(|name| name == cache_name)
  }
}

impl Default for CacheNames {
  fn default() -> Self {
    Self::new(SW_VERSION)
  }
}
