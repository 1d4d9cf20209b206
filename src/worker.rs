//! The edge worker: one object per installed worker generation, with a
//! handler per inbound event.

use color_eyre::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{BucketStore, Served, StorageError, StrategyEngine};
use crate::config::Config;
use crate::host::ClientHost;
use crate::lifecycle::{ActivationReport, InstallReport, Lifecycle, LifecycleError, LifecycleState};
use crate::network::{Fetcher, Request};
use crate::push::{ClickOutcome, Notification, PushDispatcher};
use crate::queue::{DeferredQueue, FlushError, FlushReport, QueuedEvent};
use crate::router::{Route, RouteTable};
use crate::tasks::BackgroundTasks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
  pub install: InstallReport,
  /// Present when skip-waiting activated the worker straight away
  pub activation: Option<ActivationReport>,
}

pub struct EdgeWorker<S: BucketStore, F: Fetcher, H: ClientHost> {
  sync_tag: String,
  skip_waiting: bool,
  store: Arc<S>,
  host: Arc<H>,
  tasks: Arc<BackgroundTasks>,
  routes: RouteTable,
  engine: StrategyEngine<S, F>,
  lifecycle: Lifecycle<S, F, H>,
  queue: DeferredQueue<S, F>,
  push: PushDispatcher,
}

impl<S: BucketStore, F: Fetcher, H: ClientHost> EdgeWorker<S, F, H> {
  pub fn new(config: &Config, store: Arc<S>, network: Arc<F>, host: Arc<H>) -> Result<Self> {
    let tasks = Arc::new(BackgroundTasks::new());

    Ok(Self {
      sync_tag: config.sync.tag.clone(),
      skip_waiting: config.skip_waiting,
      routes: RouteTable::from_config(&config.routes),
      engine: StrategyEngine::new(config, store.clone(), network.clone(), tasks.clone())?,
      lifecycle: Lifecycle::new(config, store.clone(), network.clone(), host.clone())?,
      queue: DeferredQueue::new(config, store.clone(), network)?,
      push: PushDispatcher::new(config.origin_url()?, &config.push),
      store,
      host,
      tasks,
    })
  }

  pub fn state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  pub fn tasks(&self) -> &Arc<BackgroundTasks> {
    &self.tasks
  }

  /// Resume a generation installed by an earlier process.
  pub fn resume(&self) -> Result<LifecycleState, LifecycleError> {
    self.lifecycle.resume()
  }

  /// Install, and activate right away when skip-waiting is on.
  pub async fn handle_install(&self) -> Result<InstallOutcome, LifecycleError> {
    let install = self.lifecycle.install().await?;
    let activation = if self.skip_waiting {
      Some(self.lifecycle.activate().await?)
    } else {
      None
    };
    Ok(InstallOutcome {
      install,
      activation,
    })
  }

  pub async fn handle_activate(&self) -> Result<ActivationReport, LifecycleError> {
    self.lifecycle.activate().await
  }

  /// Handle an outbound request. `None` means the request is not
  /// intercepted and should go to the network untouched.
  pub async fn handle_fetch(&self, request: &Request) -> Option<Served> {
    if !self.lifecycle.is_active() {
      debug!(url = %request.url, "not active yet, passing through");
      return None;
    }

    match self.routes.classify(request) {
      Route::Passthrough => {
        debug!(method = %request.method, url = %request.url, "passing through");
        None
      }
      Route::Intercept(strategy) => {
        debug!(url = %request.url, ?strategy, "intercepting");
        Some(self.engine.serve(strategy, request).await)
      }
    }
  }

  /// Record an event for later delivery.
  pub async fn record(&self, event: QueuedEvent) -> Result<usize, StorageError> {
    self.queue.enqueue(event).await
  }

  pub async fn queued(&self) -> Result<Vec<QueuedEvent>, StorageError> {
    self.queue.entries().await
  }

  /// Handle a sync signal. Unknown tags are ignored and yield `None`.
  pub async fn handle_sync(&self, tag: &str) -> Option<Result<FlushReport, FlushError>> {
    if tag != self.sync_tag {
      debug!(tag, "ignoring unknown sync tag");
      return None;
    }

    let result = self.queue.flush().await;
    if let Err(e) = &result {
      warn!(error = %e, "sync failed, will retry on next signal");
    }
    Some(result)
  }

  pub fn handle_push(&self, payload: &[u8]) -> Option<Notification> {
    self.push.handle_push(&*self.host, payload)
  }

  pub fn handle_notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> ClickOutcome {
    let outcome = self.push.handle_click(&*self.host, notification, action);
    info!(?outcome, "notification click");
    outcome
  }

  pub fn bucket_names(&self) -> Result<BTreeSet<String>, StorageError> {
    self.store.bucket_names()
  }

  /// Wait for all background work to finish.
  pub async fn settle(&self) {
    let pending = self.tasks.pending();
    if pending > 0 {
      debug!(pending, "waiting for background work");
    }
    self.tasks.settle().await;
  }
}
