//! The page side of the worker: open clients and the notification tray.

use tracing::info;

use crate::push::Notification;

pub trait ClientHost: Send + Sync + 'static {
  /// Take control of every open client without waiting for a navigation.
  /// Returns how many clients were claimed.
  fn claim(&self) -> usize;

  fn show_notification(&self, notification: &Notification);

  fn close_notification(&self, notification: &Notification);

  /// Focus an open client showing `url`. Returns false if there is none.
  fn focus(&self, url: &str) -> bool;

  fn open_window(&self, url: &str);
}

/// Host for headless runs: there are no clients, every request is logged.
#[derive(Debug, Default)]
pub struct LogHost;

impl ClientHost for LogHost {
  fn claim(&self) -> usize {
    info!("claiming clients (none open)");
    0
  }

  fn show_notification(&self, notification: &Notification) {
    info!(
      title = %notification.title,
      body = %notification.body,
      url = notification.data.url.as_deref().unwrap_or("/"),
      "notification"
    );
  }

  fn close_notification(&self, notification: &Notification) {
    info!(title = %notification.title, "notification closed");
  }

  fn focus(&self, _url: &str) -> bool {
    false
  }

  fn open_window(&self, url: &str) {
    info!(url, "open window");
  }
}
