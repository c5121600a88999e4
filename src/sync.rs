//! Deferred write replay.
//!
//! A sync pass walks the dynamic namespace, replays every pending write whose key
//! matches the API route and whose backoff has elapsed, deletes confirmed ones and
//! reschedules the rest. Cached reads are never replayed. The pass works on a
//! snapshot: writes queued while it runs are picked up by the next trigger.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheHandle, CacheStore};
use crate::classify::{RequestClassifier, RoutingVerdict};
use crate::config::Config;
use crate::error::OfflineError;
use crate::network::Network;
use crate::request::Request;

/// Backoff and attempt limits for replaying pending writes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub factor: f64,
  /// Attempts after which an entry is kept but no longer replayed; None retries forever
  pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      initial_delay_ms: 30_000,
      max_delay_ms: 3_600_000,
      factor: 2.0,
      max_attempts: Some(10),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next replay after `attempts` failed ones.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32) as i32;
    let delay = self.initial_delay_ms as f64 * self.factor.max(1.0).powi(exponent);
    Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
  }

  pub fn is_exhausted(&self, attempts: u32) -> bool {
    self.max_attempts.is_some_and(|max| attempts >= max)
  }

  pub fn is_due(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    entry.next_attempt_at.map_or(true, |at| at <= now)
  }

  /// Fast retry for tests (no delays)
  #[cfg(test)]
  pub fn immediate(max_attempts: Option<u32>) -> Self {
    Self {
      initial_delay_ms: 0,
      max_delay_ms: 0,
      factor: 2.0,
      max_attempts,
    }
  }
}

/// Outcome counts of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Confirmed and removed
  pub replayed: usize,
  /// Failed this pass, rescheduled
  pub deferred: usize,
  /// Backoff not elapsed yet
  pub skipped: usize,
  /// Kept but out of attempts
  pub exhausted: usize,
  /// Entries that are not pending API writes
  pub untouched: usize,
}

pub struct SyncCoordinator<S: CacheStore, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  classifier: RequestClassifier,
  dynamic_cache: String,
  policy: RetryPolicy,
}

impl<S: CacheStore, N: Network> SyncCoordinator<S, N> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      storage,
      network,
      classifier: RequestClassifier::new(&config.origin, config.routing.clone()),
      dynamic_cache: config.dynamic_cache_name(),
      policy: config.sync.retry.clone(),
    }
  }

  /// Run one pass over the dynamic namespace.
  pub async fn run(&self) -> color_eyre::Result<SyncReport> {
    let handle = self.storage.open(&self.dynamic_cache)?;
    let entries = self.storage.entries(&handle)?;
    let mut report = SyncReport::default();

    for entry in entries {
      let Some(request) = entry.as_pending_write() else {
        report.untouched += 1;
        continue;
      };
      if self.classifier.classify(request) != RoutingVerdict::ApiData {
        report.untouched += 1;
        continue;
      }

      if self.policy.is_exhausted(entry.attempts) {
        warn!(
          "{} {} not replayed: {} attempts exhausted (last error: {})",
          request.method,
          request.url,
          entry.attempts,
          entry.last_error.as_deref().unwrap_or("none")
        );
        report.exhausted += 1;
        continue;
      }

      let now = Utc::now();
      if !self.policy.is_due(&entry, now) {
        report.skipped += 1;
        continue;
      }

      let outcome = self.replay(request).await;
      match outcome {
        Ok(()) => {
          // A failed delete leaves the entry for another (duplicate) replay
          match self.storage.delete_if_unchanged(&handle, &entry) {
            Ok(true) => report.replayed += 1,
            Ok(false) => {
              debug!("{} was queued again during replay, keeping the newer write", entry.key);
              report.replayed += 1;
            }
            Err(e) => {
              warn!("Replayed {} but could not remove it: {}", entry.key, e);
              report.deferred += 1;
            }
          }
        }
        Err(e) => {
          self.reschedule(&handle, &entry, &e, now);
          report.deferred += 1;
        }
      }
    }

    info!(
      "Sync pass: {} replayed, {} deferred, {} skipped, {} exhausted",
      report.replayed, report.deferred, report.skipped, report.exhausted
    );

    Ok(report)
  }

  /// Transport failures surface as `NetworkFailure`, error statuses as `SyncReplayFailure`.
  async fn replay(&self, request: &Request) -> Result<(), OfflineError> {
    let response = self.network.fetch(request).await?;

    if response.is_success() {
      debug!("Replayed {} {} ({})", request.method, request.url, response.status);
      Ok(())
    } else {
      Err(OfflineError::SyncReplayFailure {
        method: request.method.clone(),
        url: request.url.to_string(),
        reason: format!("status {}", response.status),
      })
    }
  }

  fn reschedule(
    &self,
    handle: &CacheHandle,
    entry: &CacheEntry,
    error: &OfflineError,
    now: DateTime<Utc>,
  ) {
    let mut retry = entry.clone();
    retry.attempts += 1;
    retry.last_error = Some(error.to_string());
    retry.next_attempt_at = chrono::Duration::from_std(self.policy.backoff(retry.attempts))
      .ok()
      .map(|delay| now + delay);

    warn!("Deferred (attempt {}): {}", retry.attempts, error);

    match self.storage.replace_if_unchanged(handle, entry, &retry) {
      Ok(true) => {}
      Ok(false) => debug!("{} was queued again during replay, keeping the newer write", entry.key),
      Err(e) => warn!("Failed to record replay attempt for {}: {}", entry.key, e),
    }
  }
}
