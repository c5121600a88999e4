//! Fetch policy engine that orchestrates cache and network per routing verdict.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::classify::{RequestClassifier, RoutingVerdict};
use crate::config::Config;
use crate::error::OfflineError;
use crate::network::Network;
use crate::request::{timestamp_millis, CacheKey, Request, Response};

const OFFLINE_MESSAGE: &str = "You are offline. Data will sync when connection is restored.";

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Stored response from any namespace
  Cache,
  /// Synthesized JSON standing in for unreachable data or auth endpoints
  Placeholder,
  /// Offline document or explicit offline error
  Fallback,
  /// Write accepted locally, waiting for sync
  Queued,
}

/// Response plus metadata about the source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  pub verdict: RoutingVerdict,
}

impl Served {
  fn new(response: Response, source: ResponseSource, verdict: RoutingVerdict) -> Self {
    Self {
      response,
      source,
      verdict,
    }
  }
}

/// Executes the strategy selected by the classifier. The only side effects are
/// writes into the dynamic namespace; the static namespace is never written here.
pub struct FetchPolicy<S: CacheStore, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  classifier: RequestClassifier,
  dynamic_cache: String,
  offline_page: Option<CacheKey>,
}

impl<S: CacheStore, N: Network> FetchPolicy<S, N> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Self {
    let offline_page = match config.resolve(&config.offline_page) {
      Ok(url) => Some(CacheKey::get(&url)),
      Err(e) => {
        warn!("Offline page unusable: {}", e);
        None
      }
    };

    Self {
      storage,
      network,
      classifier: RequestClassifier::new(&config.origin, config.routing.clone()),
      dynamic_cache: config.dynamic_cache_name(),
      offline_page,
    }
  }

  /// Serve a request. Always yields a response; failures are folded into fallbacks.
  pub async fn handle(&self, request: &Request) -> Served {
    let verdict = self.classifier.classify(request);
    debug!("{} {} -> {:?}", request.method, request.url, verdict);

    match verdict {
      RoutingVerdict::Bypass => self.network_only(request, verdict).await,
      RoutingVerdict::StaticAsset => self.cache_first(request, verdict).await,
      RoutingVerdict::ApiData => self.network_first(request, verdict).await,
      RoutingVerdict::Other => self.passthrough(request, verdict).await,
    }
  }

  /// Network only; an unreachable endpoint yields a structured JSON error.
  async fn network_only(&self, request: &Request, verdict: RoutingVerdict) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::new(response, ResponseSource::Network, verdict),
      Err(e) => {
        debug!("Bypass request failed: {}", e);
        Served::new(
          Response::json(
            503,
            &json!({
              "error": "Network unavailable",
              "timestamp": timestamp_millis(Utc::now()),
            }),
          ),
          ResponseSource::Placeholder,
          verdict,
        )
      }
    }
  }

  /// Cache first.
  ///
  /// 1. Any namespace holding the key answers without touching the network
  /// 2. Otherwise fetch, and keep a copy of successful responses in the dynamic namespace
  /// 3. With neither, HTML requests get the offline document, others an explicit 503
  async fn cache_first(&self, request: &Request, verdict: RoutingVerdict) -> Served {
    let key = request.cache_key();
    match self.lookup(&key) {
      Ok(response) => return Served::new(response, ResponseSource::Cache, verdict),
      Err(e) => debug!("{}", e),
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if request.is_get() && response.is_success() {
          self.store_response(key, &response);
        }
        Served::new(response, ResponseSource::Network, verdict)
      }
      Err(e) => {
        debug!("Static asset unavailable: {}", e);
        let response = if request.accepts_html() {
          self.offline_document()
        } else {
          Response::new(503, "text/plain", "Offline: resource not cached")
        };
        Served::new(response, ResponseSource::Fallback, verdict)
      }
    }
  }

  /// Network first.
  ///
  /// 1. Fetch; every resolved GET response is written through to the dynamic namespace
  /// 2. On failure serve the cached copy if any
  /// 3. Otherwise queue writes for sync and answer with the offline data placeholder
  async fn network_first(&self, request: &Request, verdict: RoutingVerdict) -> Served {
    let key = request.cache_key();

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        if request.is_get() {
          self.store_response(key, &response);
        }
        return Served::new(response, ResponseSource::Network, verdict);
      }
      Err(e) => e,
    };

    debug!("API request failed, falling back to cache: {}", error);

    if request.is_get() {
      if let Ok(response) = self.lookup(&key) {
        return Served::new(response, ResponseSource::Cache, verdict);
      }
      return Served::new(offline_placeholder(false), ResponseSource::Placeholder, verdict);
    }

    match self.queue_write(request) {
      Ok(()) => Served::new(offline_placeholder(true), ResponseSource::Queued, verdict),
      Err(e) => {
        warn!("Failed to queue {} {}: {}", request.method, request.url, e);
        Served::new(offline_placeholder(false), ResponseSource::Placeholder, verdict)
      }
    }
  }

  /// No special handling and no caching, but never an undefined result.
  async fn passthrough(&self, request: &Request, verdict: RoutingVerdict) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::new(response, ResponseSource::Network, verdict),
      Err(e) => Served::new(
        Response::json(
          503,
          &json!({
            "error": e.reason,
            "timestamp": timestamp_millis(Utc::now()),
          }),
        ),
        ResponseSource::Fallback,
        verdict,
      ),
    }
  }

  fn lookup(&self, key: &CacheKey) -> Result<Response, OfflineError> {
    match self.storage.match_any(key) {
      Ok(Some(entry)) => entry
        .as_response()
        .cloned()
        .ok_or_else(|| OfflineError::CacheMiss(key.to_string())),
      Ok(None) => Err(OfflineError::CacheMiss(key.to_string())),
      Err(e) => {
        warn!("Cache lookup for {} failed: {}", key, e);
        Err(OfflineError::CacheMiss(key.to_string()))
      }
    }
  }

  fn store_response(&self, key: CacheKey, response: &Response) {
    let result = self.storage.open(&self.dynamic_cache).and_then(|handle| {
      self
        .storage
        .put(&handle, &CacheEntry::response(key.clone(), response.clone()))
    });
    if let Err(e) = result {
      warn!("Failed to cache {}: {}", key, e);
    }
  }

  /// Record a write for replay on the next sync pass.
  pub fn queue_write(&self, request: &Request) -> color_eyre::Result<()> {
    let handle = self.storage.open(&self.dynamic_cache)?;
    self
      .storage
      .put(&handle, &CacheEntry::pending_write(request.clone()))?;
    debug!("Queued {} {} for sync", request.method, request.url);
    Ok(())
  }

  fn offline_document(&self) -> Response {
    if let Some(key) = &self.offline_page {
      if let Ok(response) = self.lookup(key) {
        return response;
      }
    }
    Response::new(503, "text/html; charset=utf-8", OFFLINE_DOCUMENT)
  }
}

/// Body the application renders as its "no data yet" state.
pub fn offline_placeholder(queued: bool) -> Response {
  let mut body = json!({
    "offline": true,
    "message": OFFLINE_MESSAGE,
    "timestamp": timestamp_millis(Utc::now()),
    "children": [],
    "defaulters": [],
  });
  if queued {
    body["queued"] = json!(true);
  }
  Response::json(200, &body)
}

const OFFLINE_DOCUMENT: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline. Reconnect and try again.</p></body></html>";
