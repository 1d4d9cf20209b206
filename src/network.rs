//! Outbound requests and the network seam.

use clap::ValueEnum;
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cache::{RequestKey, Snapshot};

/// Network failures. A non-2xx response is *not* one of these.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("invalid url: {0}")]
  InvalidUrl(String),

  #[error("unreachable: {0}")]
  Unreachable(String),
}

/// Expected content category of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Destination {
  /// A navigation to a page
  Document,
  /// An image slot
  Image,
  /// Scripts, styles, data and anything else
  #[default]
  Other,
}

impl Destination {
  /// Guess the category from the path, for callers that do not know it.
  pub fn infer(url: &Url) -> Self {
    let path = url.path().to_ascii_lowercase();
    let segment = path.rsplit('/').next().unwrap_or_default();
    // Dots inside a slug are not an extension
    let ext = segment
      .rsplit_once('.')
      .map(|(_, ext)| ext)
      .filter(|ext| {
        !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
      });

    match ext {
      Some("png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif") => Self::Image,
      Some("html" | "htm") => Self::Document,
      // Extension-less paths are page routes in a client-routed app
      None if !path.starts_with("/api/") => Self::Document,
      _ => Self::Other,
    }
  }
}

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url, destination: Destination) -> Self {
    Self {
      method,
      url,
      destination,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A `GET` whose destination is inferred from the path.
  pub fn get(url: Url) -> Self {
    let destination = Destination::infer(&url);
    Self::new(Method::GET, url, destination)
  }

  /// A `POST` carrying a JSON body.
  pub fn post_json(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::POST,
      url,
      destination: Destination::Other,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: Some(body),
    }
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Anything that can turn a request into a response.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Snapshot, FetchError>> + Send;
}

/// Fetcher backed by a real HTTP client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("edgecache/", env!("CARGO_PKG_VERSION")))
      .build()?;
    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Snapshot, FetchError> {
    if !matches!(request.url.scheme(), "http" | "https") {
      return Err(FetchError::InvalidUrl(request.url.to_string()));
    }

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?;

    Ok(Snapshot::new(status, headers, body.to_vec()))
  }
}
