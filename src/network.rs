//! Network capability used by the strategies and by install.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::time::Duration;

use crate::http::{Request, Response};

/// Issues a request over the network.
///
/// The returned future owns everything it needs so it can be moved into a
/// background task and outlive the caller.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> BoxFuture<'static, Result<Response>>;
}

/// `reqwest`-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder =
      reqwest::Client::builder().user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &Request) -> BoxFuture<'static, Result<Response>> {
    let client = self.client.clone();
    let request = request.clone();

    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let res = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let status = res.status().as_u16();
      let headers = res
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = res
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

      Ok(Response {
        status,
        headers,
        body: body.to_vec(),
      })
    })
  }
}

/// Scripted fetcher for tests.
#[cfg(test)]
pub mod stub {
  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[derive(Debug, Clone)]
  pub enum Reply {
    Respond(Response),
    Fail,
    /// Never resolves
    Hang,
  }

  /// Replies per URL; unknown URLs fail like an unreachable network.
  #[derive(Default)]
  pub struct StubFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: AtomicUsize,
    received: Mutex<Vec<Request>>,
  }

  impl StubFetcher {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(&self, url: &str, response: Response) {
      self.set(url, Reply::Respond(response));
    }

    pub fn fail(&self, url: &str) {
      self.set(url, Reply::Fail);
    }

    pub fn hang(&self, url: &str) {
      self.set(url, Reply::Hang);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    /// Every request handed to the network so far, in order.
    pub fn received(&self) -> Vec<Request> {
      self.received.lock().unwrap().clone()
    }

    fn set(&self, url: &str, reply: Reply) {
      self.replies.lock().unwrap().insert(url.to_string(), reply);
    }
  }

  impl Fetcher for StubFetcher {
    fn fetch(&self, request: &Request) -> BoxFuture<'static, Result<Response>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.received.lock().unwrap().push(request.clone());
      let url = request.url.to_string();
      let reply = self.replies.lock().unwrap().get(&url).cloned();

      Box::pin(async move {
        match reply {
          Some(Reply::Respond(response)) => Ok(response),
          Some(Reply::Hang) => futures::future::pending().await,
          Some(Reply::Fail) | None => Err(eyre!("Network unreachable: {}", url)),
        }
      })
    }
  }
}
