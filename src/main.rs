mod cache;
mod config;
mod http;
mod lifecycle;
mod logging;
mod network;
mod router;
mod version;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::http::Request;
use crate::network::HttpFetcher;
use crate::version::CacheNames;
use crate::worker::ServiceWorker;

/// Upper bound on waiting for background refreshes before exit.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline cache for the app shell and Data Dragon reference data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database to use instead of the configured one
  #[arg(long)]
  database: Option<PathBuf>,

  /// Keep caches in memory for this run only
  #[arg(long, conflicts_with = "database")]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate the shell cache for the configured version
  Install,
  /// Delete caches left behind by other versions
  Activate,
  /// Install if needed, then activate
  Register,
  /// Fetch a URL through the cache
  Fetch {
    /// Absolute URL, or a path relative to app_url
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print status, source and headers before the body
    #[arg(short, long)]
    include: bool,
  },
  /// List caches and their entries
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let storage: Arc<dyn CacheStorage> = if args.ephemeral {
    Arc::new(SqliteStorage::open_in_memory()?)
  } else {
    match args.database.as_ref().or(config.database.as_ref()) {
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open_default()?),
    }
  };
  let fetcher = Arc::new(HttpFetcher::new(config.network_timeout())?);
  let worker = ServiceWorker::new(&config, CacheNames::default(), Arc::clone(&storage), fetcher)?;

  match args.command {
    Command::Install => {
      let report = worker.install().await?;
      println!("Installed {} assets into {}", report.assets, report.cache_name);
    }
    Command::Activate => {
      if !worker.restore()? {
        return Err(eyre!(
          "Version {} is not installed, run `shellcache install` first",
          worker.names().version()
        ));
      }
      let report = worker.activate().await?;
      print_activation(&report);
    }
    Command::Register => match worker.start().await? {
      Some(report) => print_activation(&report),
      None => println!("Installed, waiting for older clients to close"),
    },
    Command::Fetch {
      url,
      method,
      headers,
      data,
      output,
      include,
    } => {
      // Offline first runs still answer through the network path
      if let Err(e) = worker.start().await {
        warn!(error = %e, "Worker not active, requests will not be cached");
      }

      let url = config
        .app_url()?
        .join(&url)
        .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let mut request = Request::new(&method, url);
      for header in &headers {
        let (name, value) = parse_header(header)?;
        request = request.with_header(name, value);
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }
      let client = worker.connect();
      let result = worker.handle_fetch(client, &request).await?;
      worker.disconnect(client);

      if include {
        eprintln!("{} ({})", result.data.status, result.source);
        for (name, value) in &result.data.headers {
          eprintln!("{}: {}", name, value);
        }
      }

      match output {
        Some(path) => std::fs::write(&path, &result.data.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&result.data.body)?,
      }

      // Let background refreshes land before exiting
      if tokio::time::timeout(SETTLE_TIMEOUT, worker.settle())
        .await
        .is_err()
      {
        warn!("Background refresh still running at exit, dropping it");
      }
    }
    Command::Caches => {
      for name in storage.keys()? {
        let marker = if worker.names().is_current(&name) {
          "*"
        } else {
          " "
        };
        let entries = storage.entries(&name)?;
        println!("{} {} ({} entries)", marker, name, entries.len());
        for entry in entries {
          println!(
            "    {} {} {} {}",
            entry.stored_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status,
            entry.request.method,
            entry.request.url
          );
        }
      }
    }
  }

  Ok(())
}

fn parse_header(header: &str) -> Result<(&str, &str)> {
  header
    .split_once(':')
    .map(|(name, value)| (name.trim(), value.trim()))
    .filter(|(name, _)| !name.is_empty())
    .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))
}

fn print_activation(report: &lifecycle::ActivateReport) {
  if report.deleted.is_empty() {
    println!("Activated, no stale caches");
  }
  for name in &report.deleted {
    println!("Deleted {}", name);
  }
  for name in &report.failed {
    println!("Could not delete {}", name);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_header() {
    assert_eq!(
      parse_header("Content-Type: application/json").unwrap(),
      ("Content-Type", "application/json")
    );
    assert_eq!(parse_header("X-Empty:").unwrap(), ("X-Empty", ""));
    assert!(parse_header("no separator").is_err());
    assert!(parse_header(": value").is_err());
  }
}
