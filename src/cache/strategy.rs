//! Strategy engine: the request-handling algorithms behind each route.
//!
//! Every strategy returns `Result<Served, StrategyError>`; [`StrategyEngine::serve`]
//! is the outer boundary that turns any error into an offline fallback, so
//! callers always get a response.

use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::storage::{BucketHandle, BucketStore};
use super::types::{RequestKey, Served, Snapshot};
use crate::config::Config;
use crate::fallback::OfflineFallback;
use crate::network::{FetchError, Fetcher, Request};
use crate::router::Strategy;
use crate::tasks::BackgroundTasks;

/// Why a strategy could not produce a response on its own.
#[derive(Debug, Error)]
pub enum StrategyError {
  #[error("network failed and nothing was cached: {0}")]
  Unavailable(#[from] FetchError),

  #[error("background refresh ended without a result")]
  RefreshLost,
}

pub struct StrategyEngine<S: BucketStore, F: Fetcher> {
  store: Arc<S>,
  network: Arc<F>,
  tasks: Arc<BackgroundTasks>,
  static_bucket: BucketHandle,
  dynamic_bucket: BucketHandle,
  fallback: OfflineFallback,
}

impl<S: BucketStore, F: Fetcher> StrategyEngine<S, F> {
  pub fn new(
    config: &Config,
    store: Arc<S>,
    network: Arc<F>,
    tasks: Arc<BackgroundTasks>,
  ) -> Result<Self> {
    let static_bucket = BucketHandle::new(config.static_bucket());
    let offline_page = RequestKey::new(&Method::GET, &config.resolve(&config.offline_page)?);

    Ok(Self {
      store,
      network,
      tasks,
      fallback: OfflineFallback::new(static_bucket.clone(), offline_page),
      static_bucket,
      dynamic_bucket: BucketHandle::new(config.dynamic_bucket()),
    })
  }

  /// Serve a request with the given strategy. Never fails.
  pub async fn serve(&self, strategy: Strategy, request: &Request) -> Served {
    let result = match strategy {
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::NetworkFirst | Strategy::Default => self.network_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    };

    match result {
      Ok(served) => served,
      Err(e) => {
        warn!(url = %request.url, ?strategy, error = %e, "serving offline fallback");
        self.offline_fallback(request)
      }
    }
  }

  pub fn offline_fallback(&self, request: &Request) -> Served {
    Served::fallback(self.fallback.resolve(&*self.store, request.destination))
  }

  /// Serve from the static bucket; only a miss touches the network.
  ///
  /// A cached snapshot is returned however old it is.
  pub async fn cache_first(&self, request: &Request) -> Result<Served, StrategyError> {
    let key = request.key();

    if let Some(cached) = lookup_logged(&*self.store, &self.static_bucket, &key) {
      debug!(%key, "cache hit");
      return Ok(Served::from_cache(cached));
    }

    debug!(%key, "cache miss, fetching");
    let response = self.network.fetch(request).await?;
    if response.is_success() {
      store_logged(&*self.store, &self.static_bucket, &key, &response);
    }
    Ok(Served::from_network(response))
  }

  /// Try the network; fall back to the dynamic bucket only when the fetch
  /// itself fails. Non-2xx responses are returned as-is and not stored.
  pub async fn network_first(&self, request: &Request) -> Result<Served, StrategyError> {
    let key = request.key();

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store_logged(&*self.store, &self.dynamic_bucket, &key, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        debug!(%key, error = %e, "network failed, trying cache");
        match lookup_logged(&*self.store, &self.dynamic_bucket, &key) {
          Some(cached) => Ok(Served::from_cache(cached)),
          None => Err(StrategyError::Unavailable(e)),
        }
      }
    }
  }

  /// Answer from the dynamic bucket right away and refresh it in the
  /// background. With nothing cached the caller waits for the refresh.
  ///
  /// The refresh always runs to completion, even when the cached copy has
  /// already been returned.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Served, StrategyError> {
    let key = request.key();
    let cached = lookup_logged(&*self.store, &self.dynamic_bucket, &key);

    let (tx, rx) = oneshot::channel();
    let store = Arc::clone(&self.store);
    let network = Arc::clone(&self.network);
    let bucket = self.dynamic_bucket.clone();
    let request = request.clone();

    self.tasks.spawn(async move {
      let result = network.fetch(&request).await;
      match &result {
        Ok(fresh) if fresh.is_success() => {
          store_logged(&*store, &bucket, &request.key(), fresh);
        }
        Ok(fresh) => debug!(url = %request.url, status = fresh.status, "refresh not cached"),
        // The stored copy is left as it was
        Err(e) => debug!(url = %request.url, error = %e, "background refresh failed"),
      }
      // Nobody is listening once the cached copy was served
      let _ = tx.send(result);
    });

    match cached {
      Some(snapshot) => {
        debug!(%key, "serving cached copy while revalidating");
        Ok(Served::from_cache(snapshot))
      }
      None => match rx.await {
        Ok(Ok(fresh)) => Ok(Served::from_network(fresh)),
        Ok(Err(e)) => Err(StrategyError::Unavailable(e)),
        Err(_) => Err(StrategyError::RefreshLost),
      },
    }
  }
}

/// Bucket read that treats storage failure as a miss.
fn lookup_logged<S: BucketStore>(
  store: &S,
  bucket: &BucketHandle,
  key: &RequestKey,
) -> Option<Snapshot> {
  match store.lookup(bucket, key) {
    Ok(found) => found,
    Err(e) => {
      warn!(bucket = bucket.name(), %key, error = %e, "cache read failed, treating as miss");
      None
    }
  }
}

/// Bucket write that logs failure instead of failing the request.
fn store_logged<S: BucketStore>(
  store: &S,
  bucket: &BucketHandle,
  key: &RequestKey,
  snapshot: &Snapshot,
) {
  if let Err(e) = store.put(bucket, key, snapshot) {
    warn!(bucket = bucket.name(), %key, error = %e, "cache write failed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::network::Destination;
  use crate::testing::{BrokenStorage, MockNetwork};
  use std::time::Duration;
  use url::Url;

  struct Fixture<S: BucketStore> {
    engine: StrategyEngine<S, MockNetwork>,
    store: Arc<S>,
    network: Arc<MockNetwork>,
    tasks: Arc<BackgroundTasks>,
    config: Config,
  }

  fn fixture_with<S: BucketStore>(store: S) -> Fixture<S> {
    let config = Config::default();
    let store = Arc::new(store);
    let network = Arc::new(MockNetwork::new());
    let tasks = Arc::new(BackgroundTasks::new());
    let engine =
      StrategyEngine::new(&config, store.clone(), network.clone(), tasks.clone()).unwrap();
    Fixture {
      engine,
      store,
      network,
      tasks,
      config,
    }
  }

  fn fixture() -> Fixture<SqliteStorage> {
    fixture_with(SqliteStorage::in_memory(None).unwrap())
  }

  fn request(path: &str, destination: Destination) -> Request {
    let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
    Request::new(Method::GET, url, destination)
  }

  impl Fixture<SqliteStorage> {
    fn seed(&self, bucket: &str, path: &str, body: &str) {
      let handle = self.store.open(bucket).unwrap();
      let key = request(path, Destination::Other).key();
      self
        .store
        .put(&handle, &key, &Snapshot::new(200, vec![], body))
        .unwrap();
    }

    fn stored(&self, bucket: &str, path: &str) -> Option<Snapshot> {
      let handle = self.store.open(bucket).unwrap();
      self
        .store
        .lookup(&handle, &request(path, Destination::Other).key())
        .unwrap()
    }
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once() {
    let f = fixture();
    f.network.respond("/_next/static/app.js", 200, "js");
    let req = request("/_next/static/app.js", Destination::Other);

    let first = f.engine.serve(Strategy::CacheFirst, &req).await;
    let second = f.engine.serve(Strategy::CacheFirst, &req).await;

    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.snapshot.body, b"js");
    assert_eq!(f.network.calls("/_next/static/app.js"), 1);
  }

  #[tokio::test]
  async fn test_cache_first_serves_cache_while_offline() {
    let f = fixture();
    f.seed(&f.config.static_bucket(), "/logo.png", "png");
    f.network.set_offline(true);

    let served = f
      .engine
      .serve(Strategy::CacheFirst, &request("/logo.png", Destination::Image))
      .await;
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(f.network.calls("/logo.png"), 0);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let f = fixture();
    let req = request("/_next/static/missing.js", Destination::Other);

    let first = f.engine.serve(Strategy::CacheFirst, &req).await;
    f.engine.serve(Strategy::CacheFirst, &req).await;

    assert_eq!(first.status(), 404);
    assert_eq!(f.network.calls("/_next/static/missing.js"), 2);
  }

  #[tokio::test]
  async fn test_cache_first_miss_while_offline_falls_back() {
    let f = fixture();
    f.network.set_offline(true);

    let served = f
      .engine
      .serve(Strategy::CacheFirst, &request("/hero.jpg", Destination::Image))
      .await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.status(), 503);
    assert!(served.snapshot.body.is_empty());
  }

  #[tokio::test]
  async fn test_network_first_stores_success() {
    let f = fixture();
    f.network.respond("/api/me", 200, "{\"name\":\"ada\"}");

    let served = f
      .engine
      .serve(Strategy::NetworkFirst, &request("/api/me", Destination::Other))
      .await;

    assert_eq!(served.source, ResponseSource::Network);
    let stored = f.stored(&f.config.dynamic_bucket(), "/api/me").unwrap();
    assert_eq!(stored.body, served.snapshot.body);
  }

  #[tokio::test]
  async fn test_network_first_degrades_to_cache_then_fallback() {
    let f = fixture();
    f.seed(&f.config.dynamic_bucket(), "/api/courses", "[1,2]");
    f.seed(&f.config.static_bucket(), "/offline", "offline page");
    f.network.set_offline(true);

    let cached = f
      .engine
      .serve(Strategy::NetworkFirst, &request("/api/courses", Destination::Other))
      .await;
    assert_eq!(cached.source, ResponseSource::Cache);
    assert_eq!(cached.snapshot.body, b"[1,2]");

    let page = f
      .engine
      .serve(Strategy::NetworkFirst, &request("/about", Destination::Document))
      .await;
    assert_eq!(page.source, ResponseSource::Fallback);
    assert_eq!(page.snapshot.body, b"offline page");

    let data = f
      .engine
      .serve(Strategy::NetworkFirst, &request("/api/grades", Destination::Other))
      .await;
    assert_eq!(data.source, ResponseSource::Fallback);
    assert_eq!(data.status(), 503);
  }

  #[tokio::test]
  async fn test_network_first_returns_server_errors_without_cache() {
    let f = fixture();
    f.seed(&f.config.dynamic_bucket(), "/api/chat", "old answer");
    f.network.respond("/api/chat", 500, "boom");

    let served = f
      .engine
      .serve(Strategy::NetworkFirst, &request("/api/chat", Destination::Other))
      .await;

    // A 500 is a response, not a failed fetch
    assert_eq!(served.status(), 500);
    assert_eq!(served.source, ResponseSource::Network);
    let stored = f.stored(&f.config.dynamic_bucket(), "/api/chat").unwrap();
    assert_eq!(stored.body, b"old answer");
  }

  #[tokio::test]
  async fn test_default_behaves_as_network_first() {
    let f = fixture();
    f.network.respond("/terms", 200, "terms");

    let served = f
      .engine
      .serve(Strategy::Default, &request("/terms", Destination::Document))
      .await;
    assert_eq!(served.source, ResponseSource::Network);
    assert!(f.stored(&f.config.dynamic_bucket(), "/terms").is_some());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_stale_then_refreshes() {
    let f = fixture();
    f.seed(&f.config.dynamic_bucket(), "/", "stale home");
    f.network.respond("/", 200, "fresh home");
    f.network.set_delay("/", Duration::from_millis(50));

    let served = f
      .engine
      .serve(Strategy::StaleWhileRevalidate, &request("/", Destination::Document))
      .await;
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.snapshot.body, b"stale home");

    f.tasks.settle().await;

    let stored = f.stored(&f.config.dynamic_bucket(), "/").unwrap();
    assert_eq!(stored.body, b"fresh home");
    f.network.set_offline(true);
    let next = f
      .engine
      .serve(Strategy::NetworkFirst, &request("/", Destination::Document))
      .await;
    assert_eq!(next.snapshot.body, b"fresh home");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_waits_when_nothing_cached() {
    let f = fixture();
    f.network.respond("/dashboard", 200, "dash");

    let served = f
      .engine
      .serve(
        Strategy::StaleWhileRevalidate,
        &request("/dashboard", Destination::Document),
      )
      .await;
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.snapshot.body, b"dash");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_failed_refresh_keeps_cache() {
    let f = fixture();
    f.seed(&f.config.dynamic_bucket(), "/profile", "cached profile");
    f.network.set_offline(true);

    let served = f
      .engine
      .serve(
        Strategy::StaleWhileRevalidate,
        &request("/profile", Destination::Document),
      )
      .await;
    f.tasks.settle().await;

    assert_eq!(served.snapshot.body, b"cached profile");
    let stored = f.stored(&f.config.dynamic_bucket(), "/profile").unwrap();
    assert_eq!(stored.body, b"cached profile");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_nothing_anywhere_is_an_error() {
    let f = fixture();
    f.network.set_offline(true);

    let result = f
      .engine
      .stale_while_revalidate(&request("/courses", Destination::Document))
      .await;
    assert!(matches!(result, Err(StrategyError::Unavailable(_))));
  }

  #[tokio::test]
  async fn test_broken_storage_falls_through_to_network() {
    let f = fixture_with(BrokenStorage);
    f.network.respond("/_next/static/app.css", 200, "css");

    let served = f
      .engine
      .serve(
        Strategy::CacheFirst,
        &request("/_next/static/app.css", Destination::Other),
      )
      .await;
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.snapshot.body, b"css");
  }

  #[tokio::test]
  async fn test_quota_exceeded_still_returns_response() {
    let f = fixture_with(SqliteStorage::in_memory(Some(4)).unwrap());
    f.network.respond("/api/report", 200, "a large report body");

    let req = request("/api/report", Destination::Other);
    let served = f.engine.serve(Strategy::NetworkFirst, &req).await;
    assert_eq!(served.snapshot.body, b"a large report body");

    let handle = f.store.open(&f.config.dynamic_bucket()).unwrap();
    assert!(f.store.lookup(&handle, &req.key()).unwrap().is_none());
  }
}
