//! Push notifications and click routing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::messages::ClientHost;

/// Inbound push payload; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse raw push data. Non-JSON data is shown as the body text.
  pub fn parse(raw: &str) -> Self {
    serde_json::from_str(raw).unwrap_or_else(|_| Self {
      body: Some(raw.to_string()),
      ..Self::default()
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
  pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

/// A click on a shown notification or one of its actions.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationClick {
  /// Action id; None for a click on the notification body
  #[serde(default)]
  pub action: Option<String>,
  #[serde(default)]
  pub tag: Option<String>,
  #[serde(default)]
  pub data: Option<NotificationData>,
}

/// What a click ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Dismissed,
  Focused(String),
  Opened(Option<String>),
}

pub struct NotificationPresenter<C: ClientHost> {
  host: Arc<C>,
  app_name: String,
  icon: String,
  badge: String,
}

impl<C: ClientHost> NotificationPresenter<C> {
  pub fn new(config: &Config, host: Arc<C>) -> Self {
    Self {
      host,
      app_name: config.app_name.clone(),
      icon: config.notifications.icon.clone(),
      badge: config.notifications.badge.clone(),
    }
  }

  /// Build the notification for a push, or None when there is no payload.
  pub fn build(&self, raw: Option<&str>) -> Option<Notification> {
    let raw = raw.map(str::trim).filter(|raw| !raw.is_empty())?;
    let payload = PushPayload::parse(raw);

    Some(Notification {
      title: payload.title.unwrap_or_else(|| self.app_name.clone()),
      body: payload.body.unwrap_or_default(),
      icon: self.icon.clone(),
      badge: self.badge.clone(),
      tag: format!("push-{}", Utc::now().timestamp_millis()),
      data: NotificationData {
        url: payload.url.unwrap_or_else(|| "/".to_string()),
      },
      actions: vec![
        NotificationAction {
          action: "view".into(),
          title: "View".into(),
        },
        NotificationAction {
          action: "close".into(),
          title: "Close".into(),
        },
      ],
    })
  }

  pub async fn on_push(&self, raw: Option<&str>) -> Option<Notification> {
    let Some(notification) = self.build(raw) else {
      debug!("Push without payload ignored");
      return None;
    };

    info!("Showing notification '{}'", notification.title);
    self.host.show_notification(&notification).await;
    Some(notification)
  }

  /// Route a click. "close" only dismisses; anything else focuses an open
  /// instance (the focused one, else the first) or opens a new one.
  pub async fn on_click(&self, click: &NotificationClick) -> ClickOutcome {
    if let Some(tag) = &click.tag {
      self.host.close_notification(tag).await;
    }

    if click.action.as_deref() == Some("close") {
      return ClickOutcome::Dismissed;
    }

    let clients = self.host.clients().await;
    let target = clients
      .iter()
      .find(|client| client.focused)
      .or_else(|| clients.first());

    if let Some(client) = target {
      if self.host.focus(&client.id).await {
        return ClickOutcome::Focused(client.id.clone());
      }
    }

    let url = click
      .data
      .as_ref()
      .map(|data| data.url.as_str())
      .unwrap_or("/");
    ClickOutcome::Opened(self.host.open_window(url).await)
  }
}
