//! Line-delimited JSON host: events in on stdin, effects out on stdout.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::messages::{ClientHost, ClientInfo, ControlMessage, OutboundMessage};
use crate::network::Network;
use crate::notify::{Notification, NotificationClick};
use crate::policy::{ResponseSource, Served};
use crate::request::{Headers, Request};
use crate::worker::{EventOutcome, Worker, WorkerEvent};

/// One stdin line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
  Install,
  Activate,
  Fetch {
    id: String,
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_encoding: BodyEncoding,
  },
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  PeriodicSync {
    #[serde(default)]
    tag: Option<String>,
  },
  /// Connectivity restored: fires every registered sync
  Online,
  Push {
    #[serde(default)]
    payload: Option<Value>,
  },
  NotificationClick(NotificationClick),
  Message {
    #[serde(default)]
    client: Option<String>,
    message: ControlMessage,
  },
  ClientOpened {
    id: String,
    url: String,
    #[serde(default)]
    focused: bool,
  },
  ClientFocused {
    id: String,
  },
  ClientClosed {
    id: String,
  },
}

fn default_method() -> String {
  "GET".into()
}

/// How a body is carried in a JSON line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
  #[default]
  Utf8,
  Base64,
}

impl BodyEncoding {
  /// Valid UTF-8 travels as text, anything else as standard base64.
  pub fn encode(bytes: &[u8]) -> (String, Self) {
    match std::str::from_utf8(bytes) {
      Ok(text) => (text.to_string(), BodyEncoding::Utf8),
      Err(_) => (STANDARD.encode(bytes), BodyEncoding::Base64),
    }
  }

  pub fn decode(self, body: String) -> Result<Vec<u8>> {
    match self {
      BodyEncoding::Utf8 => Ok(body.into_bytes()),
      BodyEncoding::Base64 => STANDARD
        .decode(body)
        .map_err(|e| eyre!("Invalid base64 body: {}", e)),
    }
  }
}

/// One stdout line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum HostEffect {
  Response {
    id: String,
    status: u16,
    headers: Headers,
    body: String,
    body_encoding: BodyEncoding,
    source: String,
  },
  Message {
    client: String,
    message: OutboundMessage,
  },
  ShowNotification {
    notification: Notification,
  },
  CloseNotification {
    tag: String,
  },
  Focus {
    client: String,
  },
  OpenWindow {
    client: String,
    url: String,
  },
  Claim,
  Error {
    event: String,
    message: String,
  },
}

impl HostEffect {
  pub fn response(id: String, served: Served) -> Self {
    let (body, body_encoding) = BodyEncoding::encode(&served.response.body);
    HostEffect::Response {
      id,
      status: served.response.status,
      headers: served.response.headers,
      body,
      body_encoding,
      source: source_name(served.source),
    }
  }
}

/// Tracks open application instances and writes effects as JSON lines.
pub struct HostBridge {
  clients: Mutex<Vec<ClientInfo>>,
  out: Mutex<Box<dyn Write + Send>>,
  next_window: AtomicU64,
}

impl HostBridge {
  pub fn new(out: Box<dyn Write + Send>) -> Self {
    Self {
      clients: Mutex::new(Vec::new()),
      out: Mutex::new(out),
      next_window: AtomicU64::new(1),
    }
  }

  pub fn stdout() -> Self {
    Self::new(Box::new(std::io::stdout()))
  }

  pub fn emit(&self, effect: &HostEffect) {
    let line = match serde_json::to_string(effect) {
      Ok(line) => line,
      Err(e) => {
        error!("Failed to serialize effect: {}", e);
        return;
      }
    };

    let Ok(mut out) = self.out.lock() else {
      error!("Output lock poisoned");
      return;
    };
    if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
      error!("Failed to write effect: {}", e);
    }
  }

  fn with_clients<T>(&self, f: impl FnOnce(&mut Vec<ClientInfo>) -> T) -> T {
    let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut clients)
  }

  pub fn client_opened(&self, id: String, url: String, focused: bool) {
    self.with_clients(|clients| {
      if focused {
        clients.iter_mut().for_each(|c| c.focused = false);
      }
      clients.retain(|c| c.id != id);
      clients.push(ClientInfo { id, url, focused });
    });
  }

  pub fn client_focused(&self, id: &str) {
    self.with_clients(|clients| {
      for client in clients.iter_mut() {
        client.focused = client.id == id;
      }
    });
  }

  pub fn client_closed(&self, id: &str) {
    self.with_clients(|clients| clients.retain(|c| c.id != id));
  }

  pub fn has_clients(&self) -> bool {
    self.with_clients(|clients| !clients.is_empty())
  }
}

#[async_trait]
impl ClientHost for HostBridge {
  async fn clients(&self) -> Vec<ClientInfo> {
    self.with_clients(|clients| clients.clone())
  }

  async fn post_message(&self, client_id: &str, message: &OutboundMessage) {
    self.emit(&HostEffect::Message {
      client: client_id.to_string(),
      message: message.clone(),
    });
  }

  async fn focus(&self, client_id: &str) -> bool {
    let found = self.with_clients(|clients| clients.iter().any(|c| c.id == client_id));
    if found {
      self.client_focused(client_id);
      self.emit(&HostEffect::Focus {
        client: client_id.to_string(),
      });
    }
    found
  }

  async fn open_window(&self, url: &str) -> Option<String> {
    let id = format!("window-{}", self.next_window.fetch_add(1, Ordering::Relaxed));
    self.client_opened(id.clone(), url.to_string(), true);
    self.emit(&HostEffect::OpenWindow {
      client: id.clone(),
      url: url.to_string(),
    });
    Some(id)
  }

  async fn claim(&self) {
    self.emit(&HostEffect::Claim);
  }

  async fn show_notification(&self, notification: &Notification) {
    self.emit(&HostEffect::ShowNotification {
      notification: notification.clone(),
    });
  }

  async fn close_notification(&self, tag: &str) {
    self.emit(&HostEffect::CloseNotification {
      tag: tag.to_string(),
    });
  }
}

/// Host loop events
#[derive(Debug)]
pub enum Event {
  /// Parsed input line
  Host(HostEvent),
  /// Unparseable input line
  Invalid(String),
  /// Periodic sync timer
  Tick,
  /// Input closed
  Closed,
}

/// Event handler that produces events from the input stream and a periodic timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new<R>(input: R, periodic: Option<Duration>) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn input reader
    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(input).lines();
      loop {
        let event = match lines.next_line().await {
          Ok(Some(line)) if line.trim().is_empty() => continue,
          Ok(Some(line)) => parse_line(&line),
          Ok(None) => Event::Closed,
          Err(e) => {
            let _ = input_tx.send(Event::Invalid(format!("input read failed: {}", e)));
            Event::Closed
          }
        };
        let closed = matches!(event, Event::Closed);
        if input_tx.send(event).is_err() || closed {
          break;
        }
      }
    });

    // Spawn periodic timer
    if let Some(period) = periodic {
      tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
          interval.tick().await;
          if tx.send(Event::Tick).is_err() {
            break;
          }
        }
      });
    }

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn parse_line(line: &str) -> Event {
  match serde_json::from_str::<HostEvent>(line) {
    Ok(event) => Event::Host(event),
    Err(e) => Event::Invalid(format!("{}: {}", e, line)),
  }
}

/// Translate a host event into worker events tagged with the fetch id, if any.
/// Client bookkeeping is handled inline and yields nothing.
pub fn translate(
  config: &Config,
  bridge: &HostBridge,
  event: HostEvent,
) -> Result<Vec<(Option<String>, WorkerEvent)>> {
  let events = match event {
    HostEvent::Install => vec![(None, WorkerEvent::Install)],
    HostEvent::Activate => vec![(None, WorkerEvent::Activate)],
    HostEvent::Fetch {
      id,
      method,
      url,
      headers,
      body,
      body_encoding,
    } => {
      let url = match Url::parse(&url) {
        Ok(url) => url,
        Err(_) => config.resolve(&url)?,
      };
      let mut request = Request::new(&method, url);
      request.headers = headers
        .into_iter()
        .map(|(name, value)| (name.to_lowercase(), value))
        .collect();
      request.body = body.map(|body| body_encoding.decode(body)).transpose()?;
      vec![(Some(id), WorkerEvent::Fetch(request))]
    }
    HostEvent::Sync { tag } => vec![(
      None,
      WorkerEvent::Sync {
        tag: tag.unwrap_or_else(|| config.sync.tag.clone()),
      },
    )],
    HostEvent::PeriodicSync { tag } => vec![(
      None,
      WorkerEvent::PeriodicSync {
        tag: tag.unwrap_or_else(|| config.sync.tag.clone()),
      },
    )],
    // Registrations are drained by the caller
    HostEvent::Online => Vec::new(),
    HostEvent::Push { payload } => {
      let payload = payload.map(|value| match value {
        Value::String(text) => text,
        other => other.to_string(),
      });
      vec![(None, WorkerEvent::Push { payload })]
    }
    HostEvent::NotificationClick(click) => vec![(None, WorkerEvent::NotificationClick(click))],
    HostEvent::Message { client, message } => vec![(None, WorkerEvent::Message { client, message })],
    HostEvent::ClientOpened { id, url, focused } => {
      bridge.client_opened(id, url, focused);
      Vec::new()
    }
    HostEvent::ClientFocused { id } => {
      bridge.client_focused(&id);
      Vec::new()
    }
    HostEvent::ClientClosed { id } => {
      bridge.client_closed(&id);
      Vec::new()
    }
  };
  Ok(events)
}

fn source_name(source: ResponseSource) -> String {
  format!("{:?}", source).to_lowercase()
}

/// Run the worker until the input closes, then wait for every in-flight event.
pub async fn run<S, N, R>(
  worker: Arc<Worker<S, N, HostBridge>>,
  bridge: Arc<HostBridge>,
  input: R,
) -> Result<()>
where
  S: CacheStore + 'static,
  N: Network + 'static,
  R: AsyncRead + Unpin + Send + 'static,
{
  let config = worker.config().clone();
  let mut events = EventHandler::new(input, config.sync.periodic_interval());
  let mut tasks: JoinSet<()> = JoinSet::new();

  // Install, then activate straight away when nothing is waiting on the old version
  {
    let worker = worker.clone();
    let bridge = bridge.clone();
    tasks.spawn(async move {
      let installed = worker.handle(WorkerEvent::Install).await;
      match installed {
        Ok(EventOutcome::Installed { activation: None }) if !bridge.has_clients() => {
          if let Err(e) = worker.handle(WorkerEvent::Activate).await {
            report_error(&bridge, "activate", &e);
          }
        }
        Ok(_) => {}
        Err(e) => report_error(&bridge, "install", &e),
      }
    });
  }

  loop {
    tokio::select! {
      event = events.next() => {
        let Some(event) = event else { break };
        match event {
          Event::Closed => break,
          Event::Invalid(reason) => {
            warn!("Skipping invalid input: {}", reason);
            bridge.emit(&HostEffect::Error { event: "input".into(), message: reason });
          }
          Event::Tick => {
            spawn_event(&mut tasks, &worker, &bridge, None, WorkerEvent::PeriodicSync { tag: config.sync.tag.clone() });
          }
          Event::Host(host_event) => {
            let online = matches!(host_event, HostEvent::Online);
            match translate(&config, &bridge, host_event) {
              Ok(translated) => {
                for (id, event) in translated {
                  dispatch(&mut tasks, &worker, &bridge, id, event);
                }
              }
              Err(e) => report_error(&bridge, "input", &e),
            }
            if online {
              match worker.take_sync_registrations() {
                Ok(tags) => {
                  for tag in tags {
                    spawn_event(&mut tasks, &worker, &bridge, None, WorkerEvent::Sync { tag });
                  }
                }
                Err(e) => report_error(&bridge, "online", &e),
              }
            }
          }
        }
      }
      Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
        if let Err(e) = joined {
          error!("Event task failed: {}", e);
        }
      }
    }
  }

  info!("Input closed, waiting for {} in-flight event(s)", tasks.len());
  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      error!("Event task failed: {}", e);
    }
  }

  Ok(())
}

/// Sync registrations and queued data take effect in input order, so a later
/// `online` or sync trigger always sees them. Everything else runs as a task.
fn dispatch<S, N>(
  tasks: &mut JoinSet<()>,
  worker: &Arc<Worker<S, N, HostBridge>>,
  bridge: &Arc<HostBridge>,
  id: Option<String>,
  event: WorkerEvent,
) where
  S: CacheStore + 'static,
  N: Network + 'static,
{
  let applied = match event {
    WorkerEvent::Message {
      message: ControlMessage::CacheData { url, payload },
      ..
    } => worker.cache_data(&url, &payload),
    WorkerEvent::Message {
      message: ControlMessage::RegisterSync { tag },
      ..
    } => worker.register_sync(tag),
    event => return spawn_event(tasks, worker, bridge, id, event),
  };
  if let Err(e) = applied {
    report_error(bridge, "message", &e);
  }
}

fn spawn_event<S, N>(
  tasks: &mut JoinSet<()>,
  worker: &Arc<Worker<S, N, HostBridge>>,
  bridge: &Arc<HostBridge>,
  id: Option<String>,
  event: WorkerEvent,
) where
  S: CacheStore + 'static,
  N: Network + 'static,
{
  let worker = worker.clone();
  let bridge = bridge.clone();
  tasks.spawn(async move {
    let name = event.name();
    match worker.handle(event).await {
      Ok(EventOutcome::Responded(served)) => {
        bridge.emit(&HostEffect::response(id.unwrap_or_default(), *served));
      }
      Ok(outcome) => debug!("{} handled: {:?}", name, outcome),
      Err(e) => report_error(&bridge, name, &e),
    }
  });
}

fn report_error(bridge: &HostBridge, event: &str, e: &color_eyre::Report) {
  error!("{} failed: {:#}", event, e);
  bridge.emit(&HostEffect::Error {
    event: event.to_string(),
    message: e.to_string(),
  });
}

/// Writer handing out a shared buffer, so tests can read what was emitted.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
  pub fn lines(&self) -> Vec<Value> {
    let bytes = self.0.lock().unwrap().clone();
    String::from_utf8(bytes)
      .unwrap()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect()
  }
}

#[cfg(test)]
impl Write for SharedBuffer {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.0.lock().unwrap().extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn config() -> Config {
    Config::parse("origin: https://app.test\n").unwrap()
  }

  fn bridge() -> (HostBridge, SharedBuffer) {
    let buffer = SharedBuffer::default();
    (HostBridge::new(Box::new(buffer.clone())), buffer)
  }

  fn host_event(value: Value) -> HostEvent {
    serde_json::from_value(value).unwrap()
  }

  #[test]
  fn test_parse_fetch_with_defaults() {
    let event = host_event(json!({"event": "fetch", "id": "1", "url": "/api/children"}));
    let (bridge, _) = bridge();
    let translated = translate(&config(), &bridge, event).unwrap();
    assert_eq!(translated.len(), 1);
    match &translated[0] {
      (Some(id), WorkerEvent::Fetch(request)) => {
        assert_eq!(id, "1");
        assert_eq!(request.method, "GET");
        assert_eq!(request.url.as_str(), "https://app.test/api/children");
      }
      other => panic!("unexpected translation: {:?}", other),
    }
  }

  #[test]
  fn test_fetch_headers_are_lowercased() {
    let event = host_event(json!({
      "event": "fetch", "id": "2", "method": "post",
      "url": "https://app.test/api/x", "headers": {"Accept": "text/html"}, "body": "{}"
    }));
    let (bridge, _) = bridge();
    let translated = translate(&config(), &bridge, event).unwrap();
    let WorkerEvent::Fetch(request) = &translated[0].1 else {
      panic!("expected fetch");
    };
    assert_eq!(request.method, "POST");
    assert!(request.accepts_html());
    assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
  }

  #[test]
  fn test_sync_uses_configured_tag() {
    let (bridge, _) = bridge();
    let translated = translate(&config(), &bridge, host_event(json!({"event": "sync"}))).unwrap();
    assert!(matches!(&translated[0].1, WorkerEvent::Sync { tag } if tag == "sync-data"));
  }

  #[test]
  fn test_push_payload_object_is_stringified() {
    let (bridge, _) = bridge();
    let event = host_event(json!({"event": "push", "payload": {"title": "Hi"}}));
    let translated = translate(&config(), &bridge, event).unwrap();
    match &translated[0].1 {
      WorkerEvent::Push { payload: Some(payload) } => {
        assert_eq!(serde_json::from_str::<Value>(payload).unwrap(), json!({"title": "Hi"}));
      }
      other => panic!("unexpected translation: {:?}", other),
    }
  }

  #[test]
  fn test_message_event() {
    let (bridge, _) = bridge();
    let event = host_event(json!({
      "event": "message", "client": "a", "message": {"type": "SKIP_WAITING"}
    }));
    let translated = translate(&config(), &bridge, event).unwrap();
    assert!(matches!(
      &translated[0].1,
      WorkerEvent::Message { message: ControlMessage::SkipWaiting, .. }
    ));
  }

  #[test]
  fn test_invalid_line() {
    assert!(matches!(parse_line("{\"event\":\"explode\"}"), Event::Invalid(_)));
    assert!(matches!(parse_line("not json"), Event::Invalid(_)));
    assert!(matches!(parse_line("{\"event\":\"online\"}"), Event::Host(HostEvent::Online)));
  }

  #[tokio::test]
  async fn test_client_tracking() {
    let (bridge, buffer) = bridge();
    for event in [
      json!({"event": "client_opened", "id": "a", "url": "https://app.test/", "focused": true}),
      json!({"event": "client_opened", "id": "b", "url": "https://app.test/x"}),
      json!({"event": "client_focused", "id": "b"}),
    ] {
      assert!(translate(&config(), &bridge, host_event(event)).unwrap().is_empty());
    }

    let clients = bridge.clients().await;
    assert_eq!(clients.len(), 2);
    assert!(!clients[0].focused);
    assert!(clients[1].focused);

    translate(&config(), &bridge, host_event(json!({"event": "client_closed", "id": "a"}))).unwrap();
    assert_eq!(bridge.clients().await.len(), 1);
    assert!(buffer.lines().is_empty());
  }

  #[tokio::test]
  async fn test_effects_are_json_lines() {
    let (bridge, buffer) = bridge();
    bridge.client_opened("a".into(), "https://app.test/".into(), false);

    assert!(bridge.focus("a").await);
    assert!(!bridge.focus("missing").await);
    let opened = bridge.open_window("/due").await.unwrap();
    bridge
      .post_message("a", &OutboundMessage::SyncComplete { timestamp: 7 })
      .await;

    let lines = buffer.lines();
    assert_eq!(lines[0], json!({"effect": "focus", "client": "a"}));
    assert_eq!(lines[1], json!({"effect": "open_window", "client": opened, "url": "/due"}));
    assert_eq!(
      lines[2],
      json!({"effect": "message", "client": "a", "message": {"type": "SYNC_COMPLETE", "timestamp": 7}})
    );
    // The new window takes focus
    let clients = bridge.clients().await;
    assert!(clients.iter().any(|c| c.id == opened && c.focused));
  }

  #[test]
  fn test_binary_response_body_is_lossless() {
    let png = vec![137, 80, 78, 71, 13, 10, 26, 10, 0, 255, 0];
    let served = Served {
      response: crate::request::Response::new(200, "image/png", png.clone()),
      source: ResponseSource::Network,
      verdict: crate::classify::RoutingVerdict::StaticAsset,
    };

    let line = serde_json::to_value(HostEffect::response("7".into(), served)).unwrap();
    assert_eq!(line["body_encoding"], json!("base64"));
    assert_eq!(line["source"], json!("network"));
    let body = line["body"].as_str().unwrap().to_string();
    assert_eq!(BodyEncoding::Base64.decode(body).unwrap(), png);

    let (text, encoding) = BodyEncoding::encode("{\"ok\":true}".as_bytes());
    assert_eq!(encoding, BodyEncoding::Utf8);
    assert_eq!(text, "{\"ok\":true}");
  }

  #[test]
  fn test_base64_request_body_is_decoded() {
    let bytes = vec![0u8, 159, 146, 150, 255];
    let event = host_event(json!({
      "event": "fetch", "id": "3", "method": "PUT", "url": "/api/photos/1",
      "body": STANDARD.encode(&bytes), "body_encoding": "base64"
    }));
    let (bridge, _) = bridge();
    let translated = translate(&config(), &bridge, event).unwrap();
    let WorkerEvent::Fetch(request) = &translated[0].1 else {
      panic!("expected fetch");
    };
    assert_eq!(request.body.as_deref(), Some(&bytes[..]));

    let bad = host_event(json!({
      "event": "fetch", "id": "4", "url": "/x", "body": "not base64!", "body_encoding": "base64"
    }));
    assert!(translate(&config(), &bridge, bad).is_err());
  }

  mod event_loop {
    use super::*;
    use crate::cache::SqliteStorage;
    use crate::lifecycle::LifecycleState;
    use crate::network::testing::ScriptedNetwork;
    use crate::request::Response;
    use std::io::Cursor;

    struct Fixture {
      worker: Arc<Worker<SqliteStorage, ScriptedNetwork, HostBridge>>,
      bridge: Arc<HostBridge>,
      buffer: SharedBuffer,
      storage: Arc<SqliteStorage>,
      network: Arc<ScriptedNetwork>,
    }

    fn fixture() -> Fixture {
      let config = Config::parse("origin: https://app.test\nstatic_assets: [/]\n").unwrap();
      let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
      let network = Arc::new(ScriptedNetwork::new());
      network.ok("https://app.test/", "<html></html>");
      let buffer = SharedBuffer::default();
      let bridge = Arc::new(HostBridge::new(Box::new(buffer.clone())));
      let worker = Arc::new(Worker::new(
        config,
        storage.clone(),
        network.clone(),
        bridge.clone(),
      ));
      Fixture {
        worker,
        bridge,
        buffer,
        storage,
        network,
      }
    }

    fn input(lines: &[Value]) -> Cursor<Vec<u8>> {
      let text: String = lines.iter().map(|line| format!("{}\n", line)).collect();
      Cursor::new(text.into_bytes())
    }

    #[tokio::test]
    async fn test_install_then_activate_without_clients() {
      let f = fixture();
      run(f.worker.clone(), f.bridge.clone(), input(&[])).await.unwrap();

      // Input closed immediately; startup work still ran to completion
      assert_eq!(f.worker.lifecycle_state().await, LifecycleState::Active);
      assert!(f.buffer.lines().contains(&json!({"effect": "claim"})));
      assert!(f.storage.is_ready("app-static-v1").unwrap());
    }

    #[tokio::test]
    async fn test_online_replays_registered_sync_before_returning() {
      let f = fixture();
      f.network.respond(
        "POST",
        "https://app.test/api/children",
        Response::new(201, "application/json", "{}"),
      );

      let lines = input(&[
        json!({"event": "client_opened", "id": "a", "url": "https://app.test/", "focused": true}),
        json!({"event": "message", "client": "a", "message": {"type": "REGISTER_SYNC"}}),
        json!({"event": "message", "client": "a", "message": {
          "type": "CACHE_DATA", "url": "/api/children", "payload": {"name": "Amina"}
        }}),
        json!({"event": "online"}),
      ]);
      run(f.worker.clone(), f.bridge.clone(), lines).await.unwrap();

      let posted: Vec<_> = f
        .network
        .calls()
        .into_iter()
        .filter(|request| request.method == "POST")
        .collect();
      assert_eq!(posted.len(), 1);
      assert_eq!(posted[0].body.as_deref(), Some(&br#"{"name":"Amina"}"#[..]));

      let dynamic = f.storage.open("app-dynamic-v1").unwrap();
      assert!(f.storage.entries(&dynamic).unwrap().is_empty());

      let completed = f.buffer.lines().into_iter().any(|line| {
        line["effect"] == json!("message")
          && line["client"] == json!("a")
          && line["message"]["type"] == json!("SYNC_COMPLETE")
      });
      assert!(completed);
      // Registrations are consumed by the trigger
      assert!(f.worker.take_sync_registrations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_online_with_poisoned_registrations_keeps_running() {
      let f = fixture();
      f.network.ok("https://app.test/api/children", "[]");
      f.worker.poison_registrations();

      let lines = input(&[
        json!({"event": "online"}),
        json!({"event": "fetch", "id": "after", "url": "/api/children"}),
      ]);
      run(f.worker.clone(), f.bridge.clone(), lines).await.unwrap();

      let effects = f.buffer.lines();
      assert!(effects
        .iter()
        .any(|line| line["effect"] == json!("error") && line["event"] == json!("online")));
      assert!(effects
        .iter()
        .any(|line| line["effect"] == json!("response") && line["id"] == json!("after")));
    }
  }
}
