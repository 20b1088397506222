//! Request and response values passed between the router, the strategies and the store.

use sha2::{Digest, Sha256};
use url::Url;

/// An intercepted request.
///
/// Headers and body are forwarded as-is when the request reaches the
/// network; only method and URL take part in cache matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  /// Upper-cased HTTP method
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Parse an absolute URL into a request.
  #[cfg(test)]
  pub fn parse(method: &str, url: &str) -> color_eyre::Result<Self> {
    let url = Url::parse(url)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn is_read(&self) -> bool {
    self.method == "GET"
  }

  /// Host with a non-default port appended, e.g. `localhost:8080`.
  pub fn host(&self) -> Option<String> {
    let host = self.url.host_str()?;
    Some(match self.url.port() {
      Some(port) => format!("{}:{}", host, port),
      None => host.to_string(),
    })
  }

  /// Stable key used to match stored entries: method plus full URL,
  /// query string included.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as produced by the network or read back from a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Synthetic response for reference data that is neither cached nor reachable.
  pub fn unavailable() -> Self {
    Self::new(504, Vec::new())
  }

  /// Only plain 200 responses are worth storing.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }
}
