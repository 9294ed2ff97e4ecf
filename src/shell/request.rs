//! Request and response values passed through the shell worker.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct ShellRequest {
  pub method: Method,
  pub url: Url,
  /// Header names are lowercase
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ShellRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.set_header(name, value);
    self
  }

  pub fn set_header(&mut self, name: &str, value: &str) {
    let name = name.to_ascii_lowercase();
    self.headers.retain(|(n, _)| *n != name);
    self.headers.push((name, value.to_string()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Only plain http(s) GETs are ever written to a cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET && matches!(self.url.scheme(), "http" | "https")
  }
}

/// A response as served to the application and as stored in a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ShellResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A served response plus where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: ShellResponse,
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  pub fn from_network(response: ShellResponse) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(response: ShellResponse, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Served from cache because the network failed.
  pub fn offline(response: ShellResponse, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// From cache by strategy choice
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
    }
  }
}
