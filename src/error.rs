//! Failure taxonomy for the offline layer.

use thiserror::Error;

/// A request that never produced an HTTP response (rejected, refused, timed out).
#[derive(Debug, Clone, Error)]
#[error("network request to {url} failed: {reason}")]
pub struct NetworkFailure {
  pub url: String,
  pub reason: String,
}

impl NetworkFailure {
  pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      reason: reason.into(),
    }
  }
}

#[derive(Debug, Error)]
pub enum OfflineError {
  #[error(transparent)]
  NetworkFailure(#[from] NetworkFailure),

  #[error("no cached entry for {0}")]
  CacheMiss(String),

  /// One or more manifest entries could not be fetched; the new version is discarded.
  #[error("install aborted, {} asset(s) unavailable: {}", failed.len(), failed.join(", "))]
  InstallAssetFailure { failed: Vec<String> },

  #[error("replay of {method} {url} not confirmed: {reason}")]
  SyncReplayFailure {
    method: String,
    url: String,
    reason: String,
  },

  #[error("cannot {trigger} while {state}")]
  InvalidTransition { state: String, trigger: &'static str },
}
