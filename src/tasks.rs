//! Registry of in-flight background work.
//!
//! The host must not tear the process down while work registered here is
//! still running. `settle` is the point where it waits.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Default)]
pub struct BackgroundTasks {
  set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `work` in the background and keep the process alive until it
  /// finishes. Must be called from within a tokio runtime.
  pub fn spawn<F>(&self, work: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut set = self.lock();
    // Reap whatever already finished so the set does not grow unbounded
    while let Some(result) = set.try_join_next() {
      log_join_error(result);
    }
    set.spawn(work);
  }

  /// Number of tasks not yet reaped.
  pub fn pending(&self) -> usize {
    self.lock().len()
  }

  /// Wait for every registered task, including tasks registered while
  /// waiting.
  pub async fn settle(&self) {
    loop {
      let mut pending = std::mem::take(&mut *self.lock());
      if pending.is_empty() {
        return;
      }
      while let Some(result) = pending.join_next().await {
        log_join_error(result);
      }
    }
  }

  fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.set.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
  if let Err(e) = result {
    warn!(error = %e, "background task did not complete");
  }
}
