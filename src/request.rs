//! Request and response values exchanged between the host, the cache and the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Header map with lower-cased names.
pub type Headers = BTreeMap<String, String>;

/// An outgoing request as seen by the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub method: String,
  pub url: Url,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Whether the caller would render an HTML document (navigations, `Accept: text/html`).
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  /// Canonical identity used as the cache key.
  pub fn cache_key(&self) -> CacheKey {
    CacheKey::new(&self.method, &self.url)
  }
}

/// A complete, buffered response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    let mut headers = Headers::new();
    headers.insert("content-type".to_string(), content_type.to_string());
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, "application/json", value.to_string())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type").map(String::as_str)
  }

  pub fn body_json(&self) -> serde_json::Result<serde_json::Value> {
    serde_json::from_slice(&self.body)
  }
}

/// Canonical request identity: upper-case method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  pub method: String,
  pub url: String,
}

impl CacheKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  /// SHA256 digest of the identity, used as the stored primary key.
  pub fn hash(&self) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Milliseconds since the epoch, the timestamp format used in JSON payloads.
pub fn timestamp_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}
