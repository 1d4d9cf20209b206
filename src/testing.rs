//! Test doubles shared by the unit tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::cache::{BucketHandle, BucketStore, RequestKey, Snapshot, StorageError};
use crate::host::ClientHost;
use crate::network::{FetchError, Fetcher, Request};
use crate::push::Notification;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

type FailWhen = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// Scripted network. Unscripted paths answer 404.
#[derive(Default)]
pub struct MockNetwork {
  responses: Mutex<HashMap<String, Snapshot>>,
  log: Mutex<Vec<Request>>,
  offline: AtomicBool,
  fail_when: Mutex<Option<FailWhen>>,
  delays: Mutex<HashMap<String, Duration>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) {
    lock(&self.responses).insert(path.to_string(), Snapshot::new(status, vec![], body));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn fail_when(&self, predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) {
    *lock(&self.fail_when) = Some(Box::new(predicate));
  }

  pub fn clear_failures(&self) {
    *lock(&self.fail_when) = None;
  }

  /// Hold every fetch of `path` for `delay` before answering.
  pub fn set_delay(&self, path: &str, delay: Duration) {
    lock(&self.delays).insert(path.to_string(), delay);
  }

  /// Number of fetches attempted for a path, failed ones included.
  pub fn calls(&self, path: &str) -> usize {
    lock(&self.log)
      .iter()
      .filter(|r| r.url.path() == path)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    lock(&self.log).clone()
  }
}

impl Fetcher for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Snapshot, FetchError> {
    let delay = lock(&self.delays).get(request.url.path()).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    lock(&self.log).push(request.clone());

    let scripted_failure = lock(&self.fail_when)
      .as_ref()
      .is_some_and(|fails| fails(request));
    if self.offline.load(Ordering::SeqCst) || scripted_failure {
      return Err(FetchError::Unreachable(request.url.to_string()));
    }

    let response = lock(&self.responses).get(request.url.path()).cloned();
    Ok(response.unwrap_or_else(|| Snapshot::new(404, vec![], "not found")))
  }
}

/// Storage whose every operation fails.
pub struct BrokenStorage;

fn broken() -> StorageError {
  StorageError::Backend("disk unavailable".to_string())
}

impl BucketStore for BrokenStorage {
  fn open(&self, _name: &str) -> Result<BucketHandle, StorageError> {
    Err(broken())
  }

  fn put(&self, _: &BucketHandle, _: &RequestKey, _: &Snapshot) -> Result<(), StorageError> {
    Err(broken())
  }

  fn lookup(&self, _: &BucketHandle, _: &RequestKey) -> Result<Option<Snapshot>, StorageError> {
    Err(broken())
  }

  fn delete(&self, _: &BucketHandle, _: &RequestKey) -> Result<bool, StorageError> {
    Err(broken())
  }

  fn bucket_names(&self) -> Result<BTreeSet<String>, StorageError> {
    Err(broken())
  }

  fn delete_bucket(&self, _name: &str) -> Result<bool, StorageError> {
    Err(broken())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
  Claim,
  Show(String),
  Close(String),
  Focus(String),
  Open(String),
}

/// Host that records every call and knows a fixed set of open clients.
#[derive(Default)]
pub struct RecordingHost {
  clients: Vec<String>,
  calls: Mutex<Vec<HostCall>>,
}

impl RecordingHost {
  pub fn with_clients(urls: &[&str]) -> Self {
    Self {
      clients: urls.iter().map(|u| u.to_string()).collect(),
      calls: Mutex::default(),
    }
  }

  pub fn calls(&self) -> Vec<HostCall> {
    lock(&self.calls).clone()
  }
}

impl ClientHost for RecordingHost {
  fn claim(&self) -> usize {
    lock(&self.calls).push(HostCall::Claim);
    self.clients.len()
  }

  fn show_notification(&self, notification: &Notification) {
    lock(&self.calls).push(HostCall::Show(notification.title.clone()));
  }

  fn close_notification(&self, notification: &Notification) {
    lock(&self.calls).push(HostCall::Close(notification.title.clone()));
  }

  fn focus(&self, url: &str) -> bool {
    if self.clients.iter().any(|c| c == url) {
      lock(&self.calls).push(HostCall::Focus(url.to_string()));
      true
    } else {
      false
    }
  }

  fn open_window(&self, url: &str) {
    lock(&self.calls).push(HostCall::Open(url.to_string()));
  }
}
