//! Core types stored by the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{CacheKey, Request, Response};

/// Handle to an opened namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
  name: String,
}

impl CacheHandle {
  pub(super) fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// What an entry stands for. Cached reads are served; pending writes are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
  CachedRead,
  PendingWrite,
}

impl EntryKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntryKind::CachedRead => "cached_read",
      EntryKind::PendingWrite => "pending_write",
    }
  }
}

/// Stored payload. The variant determines the entry kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntryValue {
  CachedRead(Response),
  PendingWrite(Request),
}

/// A single cache entry. Entries are replaced whole, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub value: EntryValue,
  pub inserted_at: DateTime<Utc>,
  /// Replay attempts so far (pending writes only)
  pub attempts: u32,
  /// Earliest time the next replay may run
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl CacheEntry {
  /// A stored response served for `key`.
  pub fn response(key: CacheKey, response: Response) -> Self {
    Self {
      key,
      value: EntryValue::CachedRead(response),
      inserted_at: Utc::now(),
      attempts: 0,
      next_attempt_at: None,
      last_error: None,
    }
  }

  /// A write waiting to be replayed against the remote system.
  pub fn pending_write(request: Request) -> Self {
    Self {
      key: request.cache_key(),
      value: EntryValue::PendingWrite(request),
      inserted_at: Utc::now(),
      attempts: 0,
      next_attempt_at: None,
      last_error: None,
    }
  }

  pub fn kind(&self) -> EntryKind {
    match self.value {
      EntryValue::CachedRead(_) => EntryKind::CachedRead,
      EntryValue::PendingWrite(_) => EntryKind::PendingWrite,
    }
  }

  pub fn as_response(&self) -> Option<&Response> {
    match &self.value {
      EntryValue::CachedRead(response) => Some(response),
      EntryValue::PendingWrite(_) => None,
    }
  }

  pub fn as_pending_write(&self) -> Option<&Request> {
    match &self.value {
      EntryValue::PendingWrite(request) => Some(request),
      EntryValue::CachedRead(_) => None,
    }
  }
}
