//! Push payload rendering and notification-click routing.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::config::PushConfig;
use crate::host::ClientHost;

/// Inbound push payload, as sent by the application server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushPayload {
  pub title: String,
  #[serde(default)]
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  #[serde(default)]
  pub data: PushData,
  /// Parsed for completeness; the rendered notification always carries the
  /// fixed view/dismiss pair
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushData {
  /// Where a `view` click should take the user
  pub url: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: Option<String>,
}

/// A notification ready to be shown by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub data: PushData,
  pub actions: Vec<NotificationAction>,
}

/// What a notification click led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// An already-open client at this URL was focused
  Focused(String),
  /// A new client was opened at this URL
  Opened(String),
  /// Closed without navigating
  Dismissed,
}

pub const VIEW_ACTION: &str = "view";
pub const DISMISS_ACTION: &str = "dismiss";

pub struct PushDispatcher {
  origin: Url,
  icon: String,
  badge: String,
}

impl PushDispatcher {
  pub fn new(origin: Url, config: &PushConfig) -> Self {
    Self {
      origin,
      icon: config.icon.clone(),
      badge: config.badge.clone(),
    }
  }

  /// Parse a raw payload. Malformed payloads are dropped, not escalated.
  pub fn parse(&self, raw: &[u8]) -> Option<PushPayload> {
    match serde_json::from_slice(raw) {
      Ok(payload) => Some(payload),
      Err(e) => {
        debug!(error = %e, "dropping malformed push payload");
        None
      }
    }
  }

  pub fn render(&self, payload: PushPayload) -> Notification {
    Notification {
      title: payload.title,
      body: payload.body,
      icon: payload.icon.unwrap_or_else(|| self.icon.clone()),
      badge: payload.badge.unwrap_or_else(|| self.badge.clone()),
      data: payload.data,
      actions: vec![
        NotificationAction {
          action: VIEW_ACTION.to_string(),
          title: "View".to_string(),
          icon: Some("/icons/checkmark.png".to_string()),
        },
        NotificationAction {
          action: DISMISS_ACTION.to_string(),
          title: "Dismiss".to_string(),
          icon: Some("/icons/xmark.png".to_string()),
        },
      ],
    }
  }

  /// Handle one push event: parse, render, show.
  pub fn handle_push<H: ClientHost>(&self, host: &H, raw: &[u8]) -> Option<Notification> {
    let notification = self.render(self.parse(raw)?);
    info!(title = %notification.title, "showing push notification");
    host.show_notification(&notification);
    Some(notification)
  }

  /// Route a click on a shown notification. `action` is `None` when the
  /// body rather than a button was clicked.
  pub fn handle_click<H: ClientHost>(
    &self,
    host: &H,
    notification: &Notification,
    action: Option<&str>,
  ) -> ClickOutcome {
    host.close_notification(notification);

    if action != Some(VIEW_ACTION) {
      return ClickOutcome::Dismissed;
    }

    let target = self.target_url(notification);
    if host.focus(&target) {
      ClickOutcome::Focused(target)
    } else {
      host.open_window(&target);
      ClickOutcome::Opened(target)
    }
  }

  fn target_url(&self, notification: &Notification) -> String {
    let path = notification.data.url.as_deref().unwrap_or("/");
    self
      .origin
      .join(path)
      .unwrap_or_else(|_| self.origin.clone())
      .to_string()
  }
}
