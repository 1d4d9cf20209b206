//! Deferred-write queue for events recorded while offline.
//!
//! The queue is one JSON array stored under a single key in the
//! offline-data bucket. A flush delivers every entry present when it
//! started, in order, and removes them only if all of them went through; on
//! the first failure the array is left exactly as it was. Entries delivered
//! before the failure are sent again on the next flush. Events recorded
//! while a flush is in flight are kept for the next one.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BucketHandle, BucketStore, RequestKey, Snapshot, StorageError};
use crate::config::Config;
use crate::network::{Fetcher, Request};

/// One recorded event. Only `name` and `timestamp` are interpreted; every
/// other field is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
  pub name: String,
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub fields: serde_json::Map<String, serde_json::Value>,
}

impl QueuedEvent {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      timestamp: Utc::now(),
      fields: serde_json::Map::new(),
    }
  }

  pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.fields.insert(key.into(), value);
    self
  }
}

#[derive(Debug, Error)]
pub enum FlushError {
  #[error("delivery of entry {index} ({name}) failed: {reason}")]
  Delivery {
    index: usize,
    name: String,
    reason: String,
  },

  #[error("queue storage failed: {0}")]
  Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
  pub delivered: usize,
}

pub struct DeferredQueue<S: BucketStore, F: Fetcher> {
  store: Arc<S>,
  network: Arc<F>,
  bucket: BucketHandle,
  key: RequestKey,
  endpoint: Url,
  /// Serializes read-modify-write cycles on the blob
  guard: Mutex<()>,
  /// Held for a whole flush so only one batch is in flight
  flushing: Mutex<()>,
}

impl<S: BucketStore, F: Fetcher> DeferredQueue<S, F> {
  pub fn new(config: &Config, store: Arc<S>, network: Arc<F>) -> Result<Self> {
    Ok(Self {
      store,
      network,
      bucket: BucketHandle::new(config.offline_data_bucket()),
      key: RequestKey::new(&Method::GET, &config.resolve(&config.sync.queue_key)?),
      endpoint: config.resolve(&config.sync.endpoint)?,
      guard: Mutex::new(()),
      flushing: Mutex::new(()),
    })
  }

  /// Append an event to the durable queue.
  pub async fn enqueue(&self, event: QueuedEvent) -> Result<usize, StorageError> {
    let _guard = self.guard.lock().await;
    let mut entries = self.load()?;
    entries.push(event);
    self.save(&entries)?;
    debug!(len = entries.len(), "event queued");
    Ok(entries.len())
  }

  /// Current queue contents, oldest first.
  pub async fn entries(&self) -> Result<Vec<QueuedEvent>, StorageError> {
    let _guard = self.guard.lock().await;
    self.load()
  }

  /// Deliver every queued event in order, all or nothing.
  pub async fn flush(&self) -> Result<FlushReport, FlushError> {
    let _flushing = self.flushing.lock().await;
    let entries = {
      let _guard = self.guard.lock().await;
      self.load()?
    };
    if entries.is_empty() {
      return Ok(FlushReport { delivered: 0 });
    }

    for (index, event) in entries.iter().enumerate() {
      if let Err(reason) = self.deliver(event).await {
        warn!(index, name = %event.name, %reason, "flush aborted, queue kept for retry");
        return Err(FlushError::Delivery {
          index,
          name: event.name.clone(),
          reason,
        });
      }
    }

    // Only this flush removes entries, so the batch is still the prefix
    let _guard = self.guard.lock().await;
    let mut current = self.load()?;
    let recorded_since = current.split_off(entries.len().min(current.len()));
    if recorded_since.is_empty() {
      self.store.delete(&self.bucket, &self.key)?;
    } else {
      self.save(&recorded_since)?;
    }
    info!(
      delivered = entries.len(),
      kept = recorded_since.len(),
      "offline queue flushed"
    );
    Ok(FlushReport {
      delivered: entries.len(),
    })
  }

  async fn deliver(&self, event: &QueuedEvent) -> Result<(), String> {
    let body = serde_json::to_vec(event).map_err(|e| e.to_string())?;
    let request = Request::post_json(self.endpoint.clone(), body);

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => Ok(()),
      Ok(response) => Err(format!("endpoint answered {}", response.status)),
      Err(e) => Err(e.to_string()),
    }
  }

  fn load(&self) -> Result<Vec<QueuedEvent>, StorageError> {
    match self.store.lookup(&self.bucket, &self.key)? {
      Some(snapshot) => serde_json::from_slice(&snapshot.body)
        .map_err(|e| StorageError::Corrupt(format!("offline queue: {}", e))),
      None => Ok(Vec::new()),
    }
  }

  fn save(&self, entries: &[QueuedEvent]) -> Result<(), StorageError> {
    let body = serde_json::to_vec(entries)
      .map_err(|e| StorageError::Corrupt(format!("offline queue: {}", e)))?;
    let snapshot = Snapshot::new(
      200,
      vec![("content-type".to_string(), "application/json".to_string())],
      body,
    );
    self.store.put(&self.bucket, &self.key, &snapshot)
  }
}
