use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::{BucketStore, Served, StorageError};
use crate::host::ClientHost;
use crate::lifecycle::{ActivationReport, LifecycleError};
use crate::network::{Fetcher, Request};
use crate::push::{ClickOutcome, Notification};
use crate::queue::{FlushError, FlushReport, QueuedEvent};
use crate::worker::{EdgeWorker, InstallOutcome};

/// Inbound worker events. Each carries the channel its result goes back on.
#[derive(Debug)]
pub enum WorkerEvent {
  Install {
    reply: oneshot::Sender<Result<InstallOutcome, LifecycleError>>,
  },
  Activate {
    reply: oneshot::Sender<Result<ActivationReport, LifecycleError>>,
  },
  Fetch {
    request: Request,
    /// `None` when the request was not intercepted
    reply: oneshot::Sender<Option<Served>>,
  },
  Record {
    event: QueuedEvent,
    reply: oneshot::Sender<Result<usize, StorageError>>,
  },
  Sync {
    tag: String,
    reply: oneshot::Sender<Option<Result<FlushReport, FlushError>>>,
  },
  Push {
    payload: Vec<u8>,
    reply: oneshot::Sender<Option<Notification>>,
  },
  NotificationClick {
    notification: Notification,
    action: Option<String>,
    reply: oneshot::Sender<ClickOutcome>,
  },
}

impl<S: BucketStore, F: Fetcher, H: ClientHost> EdgeWorker<S, F, H> {
  /// Run one event to completion and send its result back. A caller that
  /// stopped listening is not an error.
  pub async fn dispatch(&self, event: WorkerEvent) {
    match event {
      WorkerEvent::Install { reply } => {
        let _ = reply.send(self.handle_install().await);
      }
      WorkerEvent::Activate { reply } => {
        let _ = reply.send(self.handle_activate().await);
      }
      WorkerEvent::Fetch { request, reply } => {
        let _ = reply.send(self.handle_fetch(&request).await);
      }
      WorkerEvent::Record { event, reply } => {
        let _ = reply.send(self.record(event).await);
      }
      WorkerEvent::Sync { tag, reply } => {
        let _ = reply.send(self.handle_sync(&tag).await);
      }
      WorkerEvent::Push { payload, reply } => {
        let _ = reply.send(self.handle_push(&payload));
      }
      WorkerEvent::NotificationClick {
        notification,
        action,
        reply,
      } => {
        let _ = reply.send(self.handle_notification_click(&notification, action.as_deref()));
      }
    }
  }
}

/// Cloneable handle for submitting events to a running loop.
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSender {
  /// Submit an event built around a fresh reply channel and wait for the
  /// result.
  pub async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(make(reply))
      .map_err(|_| eyre!("Event loop has shut down"))?;
    rx.await
      .map_err(|_| eyre!("Event handler dropped without replying"))
  }
}

/// Receives events and runs each one on its own task, so a slow handler
/// never holds up the next event.
pub struct EventLoop {
  sender: EventSender,
  stop: oneshot::Sender<()>,
  handle: JoinHandle<()>,
}

impl EventLoop {
  pub fn start<S, F, H>(worker: Arc<EdgeWorker<S, F, H>>) -> Self
  where
    S: BucketStore,
    F: Fetcher,
    H: ClientHost,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let (stop, mut stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
      loop {
        let event = tokio::select! {
          _ = &mut stop_rx => break,
          event = rx.recv() => match event {
            Some(event) => event,
            None => break,
          },
        };
        let handler = Arc::clone(&worker);
        // Registered with the worker's tasks so settle() covers handlers too
        worker.tasks().spawn(async move { handler.dispatch(event).await });
      }
    });

    Self {
      sender: EventSender { tx },
      stop,
      handle,
    }
  }

  pub fn sender(&self) -> EventSender {
    self.sender.clone()
  }

  /// Stop accepting events and wait for the receive loop to exit. Handlers
  /// already running keep going; settle the worker to wait for them.
  pub async fn shutdown(self) {
    let _ = self.stop.send(());
    if let Err(e) = self.handle.await {
      warn!(error = %e, "event loop ended abnormally");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::network::Destination;
  use crate::testing::{MockNetwork, RecordingHost};
  use reqwest::Method;
  use std::time::Duration;
  use url::Url;

  fn start() -> (
    EventLoop,
    Arc<EdgeWorker<SqliteStorage, MockNetwork, RecordingHost>>,
    Arc<MockNetwork>,
  ) {
    let network = Arc::new(MockNetwork::new());
    let worker = Arc::new(
      EdgeWorker::new(
        &Config::default(),
        Arc::new(SqliteStorage::in_memory(None).unwrap()),
        network.clone(),
        Arc::new(RecordingHost::default()),
      )
      .unwrap(),
    );
    (EventLoop::start(worker.clone()), worker, network)
  }

  fn get(path: &str) -> Request {
    let url = Url::parse("http://localhost:3000").unwrap().join(path).unwrap();
    Request::new(Method::GET, url, Destination::Other)
  }

  #[tokio::test]
  async fn test_slow_fetch_does_not_block_other_events() {
    let (event_loop, worker, network) = start();
    network.respond("/api/slow", 200, "slow");
    network.respond("/api/fast", 200, "fast");
    network.set_delay("/api/slow", Duration::from_millis(500));

    let sender = event_loop.sender();
    sender
      .call(|reply| WorkerEvent::Install { reply })
      .await
      .unwrap()
      .unwrap();

    let slow_sender = sender.clone();
    let slow = tokio::spawn(async move {
      slow_sender
        .call(|reply| WorkerEvent::Fetch {
          request: get("/api/slow"),
          reply,
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = tokio::time::timeout(
      Duration::from_millis(200),
      sender.call(|reply| WorkerEvent::Fetch {
        request: get("/api/fast"),
        reply,
      }),
    )
    .await
    .expect("fast fetch waited on the slow one")
    .unwrap()
    .unwrap();
    assert_eq!(fast.snapshot.body, b"fast");

    let slow = slow.await.unwrap().unwrap().unwrap();
    assert_eq!(slow.snapshot.body, b"slow");

    event_loop.shutdown().await;
    worker.settle().await;
  }

  #[tokio::test]
  async fn test_events_after_shutdown_fail() {
    let (event_loop, _worker, _) = start();
    let sender = event_loop.sender();
    event_loop.shutdown().await;

    let result = sender
      .call(|reply| WorkerEvent::Sync {
        tag: "sync-offline-events".to_string(),
        reply,
      })
      .await;
    assert!(result.is_err());
  }
}
