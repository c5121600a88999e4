//! Process-wide worker context and event dispatch.
//!
//! One `Worker` lives for the whole process. Each event kind maps to exactly one
//! handler; `handle` resolves only once all work derived from the event (cache
//! writes, network calls, client messages) has settled.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::lifecycle::{Activation, LifecycleManager, LifecycleState};
use crate::messages::{ClientHost, ControlMessage, OutboundMessage};
use crate::network::Network;
use crate::notify::{ClickOutcome, Notification, NotificationClick, NotificationPresenter};
use crate::policy::{FetchPolicy, Served};
use crate::request::{timestamp_millis, Request};
use crate::sync::{SyncCoordinator, SyncReport};

/// Everything the worker reacts to.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  /// Connectivity restored for a registered tag
  Sync { tag: String },
  PeriodicSync { tag: String },
  Push { payload: Option<String> },
  NotificationClick(NotificationClick),
  Message {
    client: Option<String>,
    message: ControlMessage,
  },
}

impl WorkerEvent {
  pub fn name(&self) -> &'static str {
    match self {
      WorkerEvent::Install => "install",
      WorkerEvent::Activate => "activate",
      WorkerEvent::Fetch(_) => "fetch",
      WorkerEvent::Sync { .. } => "sync",
      WorkerEvent::PeriodicSync { .. } => "periodic_sync",
      WorkerEvent::Push { .. } => "push",
      WorkerEvent::NotificationClick(_) => "notification_click",
      WorkerEvent::Message { .. } => "message",
    }
  }
}

#[derive(Debug)]
pub enum EventOutcome {
  Installed { activation: Option<Activation> },
  Activated(Activation),
  Responded(Box<Served>),
  /// None when the tag did not belong to this worker
  Synced(Option<SyncReport>),
  Notified(Option<Notification>),
  Clicked(ClickOutcome),
  MessageHandled,
}

pub struct Worker<S: CacheStore, N: Network, C: ClientHost> {
  config: Config,
  host: Arc<C>,
  policy: FetchPolicy<S, N>,
  sync: SyncCoordinator<S, N>,
  presenter: NotificationPresenter<C>,
  lifecycle: AsyncMutex<LifecycleManager<S, N, C>>,
  /// One pass at a time; concurrent triggers queue behind it
  sync_pass: AsyncMutex<()>,
  registrations: Mutex<BTreeSet<String>>,
}

impl<S: CacheStore, N: Network, C: ClientHost> Worker<S, N, C> {
  pub fn new(config: Config, storage: Arc<S>, network: Arc<N>, host: Arc<C>) -> Self {
    Self {
      policy: FetchPolicy::new(&config, storage.clone(), network.clone()),
      sync: SyncCoordinator::new(&config, storage.clone(), network.clone()),
      presenter: NotificationPresenter::new(&config, host.clone()),
      lifecycle: AsyncMutex::new(LifecycleManager::new(
        &config,
        storage,
        network,
        host.clone(),
      )),
      sync_pass: AsyncMutex::new(()),
      registrations: Mutex::new(BTreeSet::new()),
      host,
      config,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub async fn handle(&self, event: WorkerEvent) -> Result<EventOutcome> {
    debug!("Handling {} event", event.name());
    match event {
      WorkerEvent::Install => self.on_install().await,
      WorkerEvent::Activate => self.on_activate().await,
      WorkerEvent::Fetch(request) => Ok(EventOutcome::Responded(Box::new(
        self.policy.handle(&request).await,
      ))),
      WorkerEvent::Sync { tag } | WorkerEvent::PeriodicSync { tag } => self.on_sync(&tag).await,
      WorkerEvent::Push { payload } => Ok(EventOutcome::Notified(
        self.presenter.on_push(payload.as_deref()).await,
      )),
      WorkerEvent::NotificationClick(click) => {
        Ok(EventOutcome::Clicked(self.presenter.on_click(&click).await))
      }
      WorkerEvent::Message { client, message } => self.on_message(client.as_deref(), message).await,
    }
  }

  async fn on_install(&self) -> Result<EventOutcome> {
    let mut lifecycle = self.lifecycle.lock().await;
    lifecycle.install().await?;

    let activation = if lifecycle.skip_waiting_requested() {
      Some(lifecycle.activate().await?)
    } else {
      None
    };
    Ok(EventOutcome::Installed { activation })
  }

  async fn on_activate(&self) -> Result<EventOutcome> {
    let mut lifecycle = self.lifecycle.lock().await;
    Ok(EventOutcome::Activated(lifecycle.activate().await?))
  }

  async fn on_sync(&self, tag: &str) -> Result<EventOutcome> {
    if tag != self.config.sync.tag {
      debug!("Ignoring sync for unknown tag {}", tag);
      return Ok(EventOutcome::Synced(None));
    }

    let pass = {
      let _pass = self.sync_pass.lock().await;
      self.sync.run().await
    };

    // Completion is announced whether or not the pass could read the store
    let message = OutboundMessage::SyncComplete {
      timestamp: timestamp_millis(Utc::now()),
    };
    for client in self.host.clients().await {
      self.host.post_message(&client.id, &message).await;
    }

    Ok(EventOutcome::Synced(Some(pass?)))
  }

  async fn on_message(&self, client: Option<&str>, message: ControlMessage) -> Result<EventOutcome> {
    debug!("Message from {}: {:?}", client.unwrap_or("unknown"), message);
    match message {
      ControlMessage::SkipWaiting => {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.skip_waiting();
        if lifecycle.state() == LifecycleState::Installed {
          lifecycle.activate().await?;
        }
      }
      ControlMessage::CacheData { url, payload } => self.cache_data(&url, &payload)?,
      ControlMessage::RegisterSync { tag } => self.register_sync(tag)?,
    }
    Ok(EventOutcome::MessageHandled)
  }

  /// Queue `payload` as a JSON POST to `url` for the next sync pass.
  pub fn cache_data(&self, url: &str, payload: &Value) -> Result<()> {
    let url = self.config.resolve(url)?;
    let request = Request::new("POST", url)
      .with_header("content-type", "application/json")
      .with_body(payload.to_string().into_bytes());
    self.policy.queue_write(&request)
  }

  /// Record a sync registration; `None` registers the configured tag.
  pub fn register_sync(&self, tag: Option<String>) -> Result<()> {
    let tag = tag.unwrap_or_else(|| self.config.sync.tag.clone());
    info!("Sync registered for {}", tag);
    self
      .registrations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(tag);
    Ok(())
  }

  /// Drain the tags registered for the next connectivity-restored trigger.
  pub fn take_sync_registrations(&self) -> Result<Vec<String>> {
    let mut registrations = self
      .registrations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(std::mem::take(&mut *registrations).into_iter().collect())
  }

  /// Leave the registration lock poisoned, as a panicking holder would.
  #[cfg(test)]
  pub fn poison_registrations(&self) {
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _held = self.registrations.lock().unwrap();
      panic!("registration holder panicked");
    }));
  }

  pub async fn lifecycle_state(&self) -> LifecycleState {
    self.lifecycle.lock().await.state()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{EntryKind, SqliteStorage};
  use crate::messages::testing::{HostCall, RecordingHost};
  use crate::network::testing::ScriptedNetwork;
  use crate::policy::ResponseSource;
  use crate::request::Response;
  use serde_json::json;
  use url::Url;

  type TestWorker = Worker<SqliteStorage, ScriptedNetwork, RecordingHost>;

  struct Fixture {
    worker: TestWorker,
    storage: Arc<SqliteStorage>,
    network: Arc<ScriptedNetwork>,
    host: Arc<RecordingHost>,
  }

  fn fixture(yaml: &str, host: RecordingHost) -> Fixture {
    let mut config = Config::parse(yaml).unwrap();
    config.sync.retry = crate::sync::RetryPolicy::immediate(None);
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let host = Arc::new(host);
    network.ok("https://app.test/", "root");
    network.ok("https://app.test/offline.html", "offline");
    Fixture {
      worker: Worker::new(config, storage.clone(), network.clone(), host.clone()),
      storage,
      network,
      host,
    }
  }

  const CONFIG: &str = "origin: https://app.test\nstatic_assets: [/, /offline.html]\n";

  #[tokio::test]
  async fn test_install_waits_without_skip_waiting() {
    let f = fixture(CONFIG, RecordingHost::new());
    let outcome = f.worker.handle(WorkerEvent::Install).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Installed { activation: None }));
    assert_eq!(f.worker.lifecycle_state().await, LifecycleState::Installed);
  }

  #[tokio::test]
  async fn test_install_with_skip_waiting_activates() {
    let yaml = format!("{}lifecycle:\n  skip_waiting: true\n", CONFIG);
    let f = fixture(&yaml, RecordingHost::new());
    let outcome = f.worker.handle(WorkerEvent::Install).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Installed { activation: Some(_) }));
    assert_eq!(f.worker.lifecycle_state().await, LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_waiting_version() {
    let f = fixture(CONFIG, RecordingHost::new());
    f.worker.handle(WorkerEvent::Install).await.unwrap();

    f.worker
      .handle(WorkerEvent::Message {
        client: Some("a".into()),
        message: ControlMessage::SkipWaiting,
      })
      .await
      .unwrap();
    assert_eq!(f.worker.lifecycle_state().await, LifecycleState::Active);
  }

  #[tokio::test]
  async fn test_failed_install_surfaces_error() {
    let f = fixture(CONFIG, RecordingHost::new());
    f.network.fail("GET", "https://app.test/offline.html");
    assert!(f.worker.handle(WorkerEvent::Install).await.is_err());
    assert_eq!(f.worker.lifecycle_state().await, LifecycleState::Redundant);
  }

  #[tokio::test]
  async fn test_cache_data_then_sync_broadcasts_completion() {
    let f = fixture(CONFIG, RecordingHost::with_clients(&[("a", true), ("b", false)]));
    f.worker
      .handle(WorkerEvent::Message {
        client: Some("a".into()),
        message: ControlMessage::CacheData {
          url: "/api/children".into(),
          payload: json!({"name": "Amina"}),
        },
      })
      .await
      .unwrap();

    let dynamic = f.storage.open("app-dynamic-v1").unwrap();
    let queued = f.storage.entries(&dynamic).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), EntryKind::PendingWrite);

    f.network.respond(
      "POST",
      "https://app.test/api/children",
      Response::new(201, "application/json", "{}"),
    );
    let outcome = f
      .worker
      .handle(WorkerEvent::Sync {
        tag: "sync-data".into(),
      })
      .await
      .unwrap();
    match outcome {
      EventOutcome::Synced(Some(report)) => assert_eq!(report.replayed, 1),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(f.storage.entries(&dynamic).unwrap().is_empty());

    let posted: Vec<_> = f
      .host
      .calls()
      .into_iter()
      .filter_map(|call| match call {
        HostCall::Post(id, OutboundMessage::SyncComplete { .. }) => Some(id),
        _ => None,
      })
      .collect();
    assert_eq!(posted, vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_sync_broadcasts_even_when_replay_fails() {
    let f = fixture(CONFIG, RecordingHost::with_clients(&[("a", true)]));
    f.worker
      .handle(WorkerEvent::Message {
        client: None,
        message: ControlMessage::CacheData {
          url: "/api/children".into(),
          payload: json!({}),
        },
      })
      .await
      .unwrap();

    let outcome = f
      .worker
      .handle(WorkerEvent::PeriodicSync {
        tag: "sync-data".into(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(Some(SyncReport { deferred: 1, .. }))));
    assert!(f
      .host
      .calls()
      .iter()
      .any(|call| matches!(call, HostCall::Post(_, OutboundMessage::SyncComplete { .. }))));
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let f = fixture(CONFIG, RecordingHost::with_clients(&[("a", true)]));
    let outcome = f
      .worker
      .handle(WorkerEvent::Sync {
        tag: "other".into(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(None)));
    assert!(f.host.calls().is_empty());
  }

  #[tokio::test]
  async fn test_register_sync_is_drained_once() {
    let f = fixture(CONFIG, RecordingHost::new());
    for tag in [None, Some("sync-data".to_string())] {
      f.worker
        .handle(WorkerEvent::Message {
          client: None,
          message: ControlMessage::RegisterSync { tag },
        })
        .await
        .unwrap();
    }
    assert_eq!(f.worker.take_sync_registrations().unwrap(), vec!["sync-data"]);
    assert!(f.worker.take_sync_registrations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_routes_through_policy() {
    let f = fixture(CONFIG, RecordingHost::new());
    let request = Request::get(Url::parse("https://app.test/api/children").unwrap());
    match f.worker.handle(WorkerEvent::Fetch(request)).await.unwrap() {
      EventOutcome::Responded(served) => {
        assert_eq!(served.source, ResponseSource::Placeholder);
        assert_eq!(served.response.body_json().unwrap()["offline"], json!(true));
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  /// Store whose every operation fails.
  struct UnavailableStorage;

  impl CacheStore for UnavailableStorage {
    fn open(&self, _: &str) -> Result<crate::cache::CacheHandle> {
      Err(eyre!("store unavailable"))
    }
    fn put(&self, _: &crate::cache::CacheHandle, _: &crate::cache::CacheEntry) -> Result<()> {
      Err(eyre!("store unavailable"))
    }
    fn put_all(&self, _: &crate::cache::CacheHandle, _: &[crate::cache::CacheEntry]) -> Result<()> {
      Err(eyre!("store unavailable"))
    }
    fn get(
      &self,
      _: &crate::cache::CacheHandle,
      _: &crate::request::CacheKey,
    ) -> Result<Option<crate::cache::CacheEntry>> {
      Err(eyre!("store unavailable"))
    }
    fn delete(&self, _: &crate::cache::CacheHandle, _: &crate::request::CacheKey) -> Result<bool> {
      Err(eyre!("store unavailable"))
    }
    fn delete_if_unchanged(
      &self,
      _: &crate::cache::CacheHandle,
      _: &crate::cache::CacheEntry,
    ) -> Result<bool> {
      Err(eyre!("store unavailable"))
    }
    fn replace_if_unchanged(
      &self,
      _: &crate::cache::CacheHandle,
      _: &crate::cache::CacheEntry,
      _: &crate::cache::CacheEntry,
    ) -> Result<bool> {
      Err(eyre!("store unavailable"))
    }
    fn keys(&self, _: &crate::cache::CacheHandle) -> Result<Vec<crate::request::CacheKey>> {
      Err(eyre!("store unavailable"))
    }
    fn entries(&self, _: &crate::cache::CacheHandle) -> Result<Vec<crate::cache::CacheEntry>> {
      Err(eyre!("store unavailable"))
    }
    fn clear(&self, _: &crate::cache::CacheHandle) -> Result<()> {
      Err(eyre!("store unavailable"))
    }
    fn match_any(&self, _: &crate::request::CacheKey) -> Result<Option<crate::cache::CacheEntry>> {
      Err(eyre!("store unavailable"))
    }
    fn mark_ready(&self, _: &crate::cache::CacheHandle) -> Result<()> {
      Err(eyre!("store unavailable"))
    }
    fn is_ready(&self, _: &str) -> Result<bool> {
      Err(eyre!("store unavailable"))
    }
    fn list_namespaces(&self) -> Result<Vec<String>> {
      Err(eyre!("store unavailable"))
    }
    fn delete_namespace(&self, _: &str) -> Result<bool> {
      Err(eyre!("store unavailable"))
    }
  }

  #[tokio::test]
  async fn test_sync_broadcasts_even_when_store_fails() {
    let config = Config::parse(CONFIG).unwrap();
    let host = Arc::new(RecordingHost::with_clients(&[("a", true)]));
    let worker = Worker::new(
      config,
      Arc::new(UnavailableStorage),
      Arc::new(ScriptedNetwork::new()),
      host.clone(),
    );

    let result = worker
      .handle(WorkerEvent::Sync {
        tag: "sync-data".into(),
      })
      .await;
    assert!(result.unwrap_err().to_string().contains("store unavailable"));
    assert!(matches!(
      host.calls().as_slice(),
      [HostCall::Post(id, OutboundMessage::SyncComplete { .. })] if id == "a"
    ));
  }
}
