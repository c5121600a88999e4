//! Version lifecycle: populate the static namespace, retire stale namespaces,
//! take control of open instances.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::config::Config;
use crate::error::OfflineError;
use crate::messages::ClientHost;
use crate::network::Network;
use crate::request::{CacheKey, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Not installed yet
  Parsed,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Active,
  /// Install failed; this version never goes live
  Redundant,
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      LifecycleState::Parsed => "parsed",
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Active => "active",
      LifecycleState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Summary of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
  pub deleted: Vec<String>,
  pub failed: Vec<String>,
  pub claimed: bool,
}

pub struct LifecycleManager<S: CacheStore, N: Network, C: ClientHost> {
  storage: Arc<S>,
  network: Arc<N>,
  host: Arc<C>,
  config: Config,
  state: LifecycleState,
  skip_waiting: bool,
}

impl<S: CacheStore, N: Network, C: ClientHost> LifecycleManager<S, N, C> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>, host: Arc<C>) -> Self {
    Self {
      storage,
      network,
      host,
      skip_waiting: config.lifecycle.skip_waiting,
      config: config.clone(),
      state: LifecycleState::Parsed,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  /// Request activation without waiting for open instances to go away.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  /// Fetch every declared asset, then store them all in one transaction and mark
  /// the static namespace ready. Any failed fetch aborts before anything is written.
  pub async fn install(&mut self) -> Result<(), OfflineError> {
    match self.state {
      LifecycleState::Parsed | LifecycleState::Redundant => {}
      state => {
        return Err(OfflineError::InvalidTransition {
          state: state.to_string(),
          trigger: "install",
        })
      }
    }
    self.state = LifecycleState::Installing;
    let namespace = self.config.static_cache_name();
    info!("Installing {} ({} assets)", namespace, self.config.static_assets.len());

    match self.fetch_assets().await {
      Ok(entries) => {
        let stored = self.storage.open(&namespace).and_then(|handle| {
          self.storage.put_all(&handle, &entries)?;
          self.storage.mark_ready(&handle)
        });
        if let Err(e) = stored {
          error!("Failed to store static assets: {}", e);
          // Leave nothing half-populated behind
          if let Err(e) = self.storage.delete_namespace(&namespace) {
            warn!("Failed to discard {}: {}", namespace, e);
          }
          self.state = LifecycleState::Redundant;
          return Err(OfflineError::InstallAssetFailure {
            failed: vec![namespace],
          });
        }
        self.state = LifecycleState::Installed;
        info!("Installed {}", namespace);
        Ok(())
      }
      Err(e) => {
        error!("{}", e);
        self.state = LifecycleState::Redundant;
        Err(e)
      }
    }
  }

  async fn fetch_assets(&self) -> Result<Vec<CacheEntry>, OfflineError> {
    let mut requests = Vec::with_capacity(self.config.static_assets.len());
    let mut failed = Vec::new();
    for path in &self.config.static_assets {
      match self.config.resolve(path) {
        Ok(url) => requests.push((path, Request::get(url))),
        Err(_) => failed.push(path.clone()),
      }
    }

    let results = join_all(requests.iter().map(|(_, request)| self.network.fetch(request))).await;

    let mut entries = Vec::with_capacity(results.len());
    for ((path, request), result) in requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_success() => {
          entries.push(CacheEntry::response(CacheKey::get(&request.url), response));
        }
        Ok(response) => {
          warn!("Asset {} answered {}", path, response.status);
          failed.push(path.to_string());
        }
        Err(e) => {
          warn!("{}", e);
          failed.push(path.to_string());
        }
      }
    }

    if failed.is_empty() {
      Ok(entries)
    } else {
      Err(OfflineError::InstallAssetFailure { failed })
    }
  }

  /// Delete every namespace other than the current static and dynamic ones, then
  /// claim open instances if configured. Deletion failures are logged and skipped.
  /// Re-running on an active version is a no-op apart from the cleanup scan.
  pub async fn activate(&mut self) -> Result<Activation, OfflineError> {
    match self.state {
      LifecycleState::Installed | LifecycleState::Active => {}
      state => {
        return Err(OfflineError::InvalidTransition {
          state: state.to_string(),
          trigger: "activate",
        })
      }
    }
    let was_active = self.state == LifecycleState::Active;
    self.state = LifecycleState::Activating;

    let current = [
      self.config.static_cache_name(),
      self.config.dynamic_cache_name(),
    ];
    let mut activation = Activation::default();

    match self.storage.list_namespaces() {
      Ok(names) => {
        for name in names.into_iter().filter(|name| !current.contains(name)) {
          match self.storage.delete_namespace(&name) {
            Ok(_) => {
              info!("Deleted stale namespace {}", name);
              activation.deleted.push(name);
            }
            Err(e) => {
              warn!("Failed to delete stale namespace {}: {}", name, e);
              activation.failed.push(name);
            }
          }
        }
      }
      Err(e) => warn!("Failed to list namespaces: {}", e),
    }

    if self.config.lifecycle.claim_clients && !was_active {
      self.host.claim().await;
      activation.claimed = true;
    }

    self.state = LifecycleState::Active;
    info!("Activated {}", self.config.version);
    Ok(activation)
  }
}
