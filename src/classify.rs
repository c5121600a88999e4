//! Request routing: maps every outgoing request to the strategy that serves it.

use url::{Origin, Url};

use crate::config::RoutingConfig;
use crate::request::Request;

/// Classification outcome for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingVerdict {
  /// Identity-provider traffic: network only, structured error when unreachable
  Bypass,
  /// Shell assets: cache first
  StaticAsset,
  /// Application data: network first
  ApiData,
  /// Anything else: passthrough, no caching
  Other,
}

/// Pure, total classifier. Rules are evaluated in order and the first match wins.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
  origin: Origin,
  rules: RoutingConfig,
}

impl RequestClassifier {
  /// Markers and extensions are matched against lower-cased host and path.
  pub fn new(origin: &Url, mut rules: RoutingConfig) -> Self {
    for marker in rules.auth_markers.iter_mut() {
      *marker = marker.to_lowercase();
    }
    for ext in rules.static_extensions.iter_mut() {
      *ext = ext.to_lowercase();
    }
    rules.api_marker = rules.api_marker.to_lowercase();
    rules.icon_marker = rules.icon_marker.to_lowercase();
    Self {
      origin: origin.origin(),
      rules,
    }
  }

  pub fn classify(&self, request: &Request) -> RoutingVerdict {
    let url = &request.url;
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let path = url.path().to_lowercase();
    let host_and_path = format!("{}{}", host, path);

    let is_auth = self
      .rules
      .auth_markers
      .iter()
      .any(|marker| host_and_path.contains(marker.as_str()));
    if is_auth {
      return RoutingVerdict::Bypass;
    }

    let same_origin = url.origin() == self.origin;
    let static_extension = self
      .rules
      .static_extensions
      .iter()
      .any(|ext| path.ends_with(ext.as_str()));
    if same_origin && (static_extension || path.contains(&self.rules.icon_marker)) {
      return RoutingVerdict::StaticAsset;
    }

    if path.contains(&self.rules.api_marker) {
      return RoutingVerdict::ApiData;
    }

    RoutingVerdict::Other
  }
}
