//! Core traits and types for the cache agent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// An outbound request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Parse `url` into a GET request.
  pub fn get_str(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// An HTML navigation, judged by the accept header.
  pub fn is_navigation(&self) -> bool {
    self
      .header("accept")
      .is_some_and(|accept| accept.contains("text/html"))
  }

  /// Normalized request identity: method plus URL without fragment.
  pub fn identity(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method.as_str().to_uppercase(), url)
  }

  /// Stable, fixed-length cache key for this request.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.identity().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response body with its status and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// The live network, as far as the cache agent is concerned.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Perform the request. `Err` means no response was obtained at all.
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Live data from a request the agent does not cache.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }

  /// Data from a cache store while the network was unavailable.
  pub fn from_cache(data: T, source: CacheSource, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Exempt from caching, always live
  Passthrough,
  /// Network unavailable, served from the runtime cache
  RuntimeCache,
  /// Network unavailable, served from the precached app shell
  Precache,
  /// Network and cache both missed; the offline page for a navigation
  OfflineFallback,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      CacheSource::Network => "network",
      CacheSource::Passthrough => "passthrough",
      CacheSource::RuntimeCache => "runtime cache",
      CacheSource::Precache => "precache",
      CacheSource::OfflineFallback => "offline fallback",
    };
    f.write_str(name)
  }
}
