use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application; same-origin checks and asset URLs resolve against it
  pub origin: Url,
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default = "default_app_name")]
  pub app_name: String,
  /// Override for the static namespace name
  pub static_cache: Option<String>,
  /// Override for the dynamic namespace name
  pub dynamic_cache: Option<String>,
  /// Paths fetched and cached verbatim at install, in order
  #[serde(default = "default_static_assets")]
  pub static_assets: Vec<String>,
  /// Document served to HTML requests when both cache and network miss
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub lifecycle: LifecycleConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Substrings of host or path that mark identity-provider traffic
  pub auth_markers: Vec<String>,
  /// Path segment that marks data/API traffic
  pub api_marker: String,
  /// Path segment that marks icon assets
  pub icon_marker: String,
  /// Same-origin path extensions treated as static assets (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub static_extensions: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      auth_markers: vec![
        "accounts.google.com".into(),
        "googleapis.com/identitytoolkit".into(),
        "securetoken.googleapis.com".into(),
        "firebaseapp.com/__/auth".into(),
        "login.microsoftonline.com".into(),
        "auth0.com".into(),
        "/oauth".into(),
      ],
      api_marker: "/api/".into(),
      icon_marker: "/icons/".into(),
      static_extensions: vec![".html".into(), ".css".into(), ".js".into()],
    }
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate right after install instead of waiting for open instances to go away
  pub skip_waiting: bool,
  /// Take control of open instances on activation
  pub claim_clients: bool,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      skip_waiting: false,
      claim_clients: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag used for connectivity and periodic sync triggers
  pub tag: String,
  /// Seconds between periodic sync passes; 0 disables the timer
  pub periodic_interval_secs: u64,
  pub retry: RetryPolicy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-data".into(),
      periodic_interval_secs: 300,
      retry: RetryPolicy::default(),
    }
  }
}

impl SyncConfig {
  pub fn periodic_interval(&self) -> Option<Duration> {
    (self.periodic_interval_secs > 0).then(|| Duration::from_secs(self.periodic_interval_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 15,
      user_agent: concat!("offline-relay/", env!("CARGO_PKG_VERSION")).into(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub icon: String,
  pub badge: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192x192.png".into(),
      badge: "/icons/icon-72x72.png".into(),
    }
  }
}

fn default_version() -> String {
  "v1".into()
}

fn default_app_name() -> String {
  "app".into()
}

fn default_static_assets() -> Vec<String> {
  vec![
    "/".into(),
    "/index.html".into(),
    "/offline.html".into(),
    "/manifest.json".into(),
  ]
}

fn default_offline_page() -> String {
  "/offline.html".into()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-relay/config.yaml
  ///
  /// `OFFLINE_RELAY_ORIGIN` overrides the configured origin.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/offline-relay/config.yaml"
        ))
      }
    };

    if let Ok(origin) = std::env::var("OFFLINE_RELAY_ORIGIN") {
      config.origin =
        Url::parse(&origin).map_err(|e| eyre!("Invalid OFFLINE_RELAY_ORIGIN '{}': {}", origin, e))?;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn static_cache_name(&self) -> String {
    self
      .static_cache
      .clone()
      .unwrap_or_else(|| format!("{}-static-{}", self.app_name, self.version))
  }

  pub fn dynamic_cache_name(&self) -> String {
    self
      .dynamic_cache
      .clone()
      .unwrap_or_else(|| format!("{}-dynamic-{}", self.app_name, self.version))
  }

  /// Resolve a manifest path or relative URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("origin: https://app.test\n").unwrap();
    assert_eq!(config.static_cache_name(), "app-static-v1");
    assert_eq!(config.dynamic_cache_name(), "app-dynamic-v1");
    assert_eq!(config.routing.api_marker, "/api/");
    assert_eq!(config.sync.tag, "sync-data");
    assert!(config.lifecycle.claim_clients);
    assert!(!config.lifecycle.skip_waiting);
    assert_eq!(config.offline_page, "/offline.html");
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
origin: https://ledger.test
version: v7
app_name: ledger
dynamic_cache: ledger-data
static_assets: [/, /app.js]
routing:
  api_marker: /data/
  static_extensions: [.HTML, .Js]
lifecycle:
  skip_waiting: true
sync:
  periodic_interval_secs: 0
  retry:
    max_attempts: 3
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.static_cache_name(), "ledger-static-v7");
    assert_eq!(config.dynamic_cache_name(), "ledger-data");
    assert_eq!(config.static_assets, vec!["/", "/app.js"]);
    assert_eq!(config.routing.static_extensions, vec![".html", ".js"]);
    // Unspecified routing keys keep their defaults
    assert_eq!(config.routing.icon_marker, "/icons/");
    assert!(config.lifecycle.skip_waiting);
    assert!(config.sync.periodic_interval().is_none());
    assert_eq!(config.sync.retry.max_attempts, Some(3));
  }

  #[test]
  fn test_missing_origin_is_error() {
    assert!(Config::parse("version: v2\n").is_err());
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::parse("origin: https://app.test/\n").unwrap();
    assert_eq!(
      config.resolve("/icons/a.png").unwrap().as_str(),
      "https://app.test/icons/a.png"
    );
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "origin: https://app.test\nversion: v9").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.version, "v9");
  }

  #[test]
  fn test_load_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/offline-relay.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
