//! Messages exchanged with application instances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notify::Notification;

/// Control messages sent by the application.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate a waiting version right away
  SkipWaiting,
  /// Queue a JSON payload for delivery to `url`
  CacheData { url: String, payload: Value },
  /// Ask for a sync once connectivity returns
  RegisterSync {
    #[serde(default)]
    tag: Option<String>,
  },
}

/// Notifications posted to application instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
  SyncComplete { timestamp: i64 },
}

/// An open application instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
  pub id: String,
  pub url: String,
  #[serde(default)]
  pub focused: bool,
}

/// The environment hosting application instances and notifications.
#[async_trait]
pub trait ClientHost: Send + Sync {
  /// Open instances in the order the host knows them.
  async fn clients(&self) -> Vec<ClientInfo>;

  async fn post_message(&self, client_id: &str, message: &OutboundMessage);

  /// Returns whether the instance was found.
  async fn focus(&self, client_id: &str) -> bool;

  /// Open a new instance at `url`; returns its id when the host could open one.
  async fn open_window(&self, url: &str) -> Option<String>;

  /// Take control of every open instance.
  async fn claim(&self);

  async fn show_notification(&self, notification: &Notification);

  async fn close_notification(&self, tag: &str);
}
