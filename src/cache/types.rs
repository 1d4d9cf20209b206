//! Core types for the bucket store: request keys, response snapshots and
//! the provenance of a served response.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Identity of a cached request: method plus normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  /// Build a key from a method and URL. The fragment never reaches the
  /// server, so it is dropped.
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method.as_str(), url))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.0.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Stored representation of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
  pub status: u16,
  /// Header name/value pairs in arrival order
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl Snapshot {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
      stored_at: Utc::now(),
    }
  }

  /// A minimal `503 Service Unavailable` response.
  pub fn unavailable(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self::new(
      503,
      vec![("content-type".to_string(), content_type.to_string())],
      body,
    )
  }

  /// 2xx-class responses are the only ones worth caching.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// From a bucket, without waiting on the network
  Cache,
  /// Synthesized or pre-cached offline response
  Fallback,
}

/// A response returned by the strategy engine, tagged with its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub snapshot: Snapshot,
  pub source: ResponseSource,
}

impl Served {
  pub fn from_network(snapshot: Snapshot) -> Self {
    Self {
      snapshot,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(snapshot: Snapshot) -> Self {
    Self {
      snapshot,
      source: ResponseSource::Cache,
    }
  }

  pub fn fallback(snapshot: Snapshot) -> Self {
    Self {
      snapshot,
      source: ResponseSource::Fallback,
    }
  }

  pub fn status(&self) -> u16 {
    self.snapshot.status
  }
}
