//! Worker lifecycle: install pre-warm, activation cutover, client claim.

use color_eyre::Result;
use futures::future::join_all;
use reqwest::Method;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BucketHandle, BucketStore, RequestKey, Snapshot, StorageError};
use crate::config::Config;
use crate::host::ClientHost;
use crate::network::{Fetcher, Request};

/// Written into the static bucket once its generation has activated. The
/// scheme is never intercepted, so no request can collide with it.
const ACTIVATED_MARKER: &str = "edgecache:activated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Uninstalled,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Active,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("cannot {action} while {state:?}")]
  InvalidTransition {
    action: &'static str,
    state: LifecycleState,
  },

  #[error("bucket store unavailable: {0}")]
  Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  /// Manifest URLs now in the static bucket
  pub cached: Vec<String>,
  /// Manifest URLs that could not be fetched or stored
  pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Buckets from previous generations that were deleted
  pub evicted: Vec<String>,
  /// Clients taken over
  pub claimed: usize,
}

pub struct Lifecycle<S: BucketStore, F: Fetcher, H: ClientHost> {
  state: Mutex<LifecycleState>,
  store: Arc<S>,
  network: Arc<F>,
  host: Arc<H>,
  manifest: Vec<Url>,
  static_bucket: String,
  activated_marker: RequestKey,
  current_buckets: BTreeSet<String>,
}

impl<S: BucketStore, F: Fetcher, H: ClientHost> Lifecycle<S, F, H> {
  pub fn new(config: &Config, store: Arc<S>, network: Arc<F>, host: Arc<H>) -> Result<Self> {
    let manifest = config
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let marker = Url::parse(ACTIVATED_MARKER)?;

    Ok(Self {
      state: Mutex::new(LifecycleState::Uninstalled),
      store,
      network,
      host,
      manifest,
      static_bucket: config.static_bucket(),
      activated_marker: RequestKey::new(&Method::GET, &marker),
      current_buckets: config.current_buckets().into_iter().collect(),
    })
  }

  pub fn state(&self) -> LifecycleState {
    *self.lock()
  }

  pub fn is_active(&self) -> bool {
    self.state() == LifecycleState::Active
  }

  /// Pre-populate the static bucket with the install manifest.
  ///
  /// Best effort: an entry that fails is logged and reported, and the
  /// rest are still cached.
  pub async fn install(&self) -> Result<InstallReport, LifecycleError> {
    self.transition("install", LifecycleState::Uninstalled, LifecycleState::Installing)?;

    let bucket = match self.store.open(&self.static_bucket) {
      Ok(bucket) => bucket,
      Err(e) => {
        self.set(LifecycleState::Uninstalled);
        return Err(e.into());
      }
    };
    // A reinstall of the same generation has to activate again
    if let Err(e) = self.store.delete(&bucket, &self.activated_marker) {
      warn!(error = %e, "failed to clear activation marker");
    }

    let fetches = self.manifest.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let outcome = self.network.fetch(&request).await;
        (request, outcome)
      }
    });

    let mut report = InstallReport::default();
    for (request, outcome) in join_all(fetches).await {
      let url = request.url.to_string();
      let stored = match outcome {
        Ok(response) if response.is_success() => self
          .store
          .put(&bucket, &request.key(), &response)
          .map_err(|e| e.to_string()),
        Ok(response) => Err(format!("status {}", response.status)),
        Err(e) => Err(e.to_string()),
      };

      match stored {
        Ok(()) => report.cached.push(url),
        Err(reason) => {
          warn!(%url, %reason, "failed to pre-cache manifest entry");
          report.failed.push(url);
        }
      }
    }

    self.set(LifecycleState::Installed);
    info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "install complete"
    );
    Ok(report)
  }

  /// Pick up a generation installed by an earlier process. It resumes as
  /// `Active` only if that process also activated it, and as `Installed`
  /// if it is still waiting.
  pub fn resume(&self) -> Result<LifecycleState, LifecycleError> {
    if !self.store.bucket_names()?.contains(&self.static_bucket) {
      return Ok(self.state());
    }

    let bucket = BucketHandle::new(self.static_bucket.as_str());
    let to = match self.store.lookup(&bucket, &self.activated_marker)? {
      Some(_) => LifecycleState::Active,
      None => LifecycleState::Installed,
    };
    self.transition("resume", LifecycleState::Uninstalled, to)?;
    debug!(bucket = %self.static_bucket, state = ?to, "resumed generation");
    Ok(to)
  }

  /// Delete every bucket not in the current generation, then take over the
  /// open clients.
  pub async fn activate(&self) -> Result<ActivationReport, LifecycleError> {
    self.transition("activate", LifecycleState::Installed, LifecycleState::Activating)?;

    let names = match self.store.bucket_names() {
      Ok(names) => names,
      Err(e) => {
        self.set(LifecycleState::Installed);
        return Err(e.into());
      }
    };

    let mut report = ActivationReport::default();
    for name in names.difference(&self.current_buckets) {
      match self.store.delete_bucket(name) {
        Ok(_) => {
          info!(bucket = %name, "evicted old bucket");
          report.evicted.push(name.clone());
        }
        Err(e) => warn!(bucket = %name, error = %e, "failed to evict old bucket"),
      }
    }

    report.claimed = self.host.claim();
    let bucket = BucketHandle::new(self.static_bucket.as_str());
    let marker = Snapshot::new(200, vec![], Vec::new());
    if let Err(e) = self.store.put(&bucket, &self.activated_marker, &marker) {
      warn!(error = %e, "failed to record activation, a restart will activate again");
    }
    self.set(LifecycleState::Active);
    info!(
      evicted = report.evicted.len(),
      claimed = report.claimed,
      "activated"
    );
    Ok(report)
  }

  fn transition(
    &self,
    action: &'static str,
    from: LifecycleState,
    to: LifecycleState,
  ) -> Result<(), LifecycleError> {
    let mut state = self.lock();
    if *state != from {
      return Err(LifecycleError::InvalidTransition {
        action,
        state: *state,
      });
    }
    *state = to;
    Ok(())
  }

  fn set(&self, to: LifecycleState) {
    *self.lock() = to;
  }

  fn lock(&self) -> MutexGuard<'_, LifecycleState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
