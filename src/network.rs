//! Network boundary.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkFailure;
use crate::request::{Headers, Request, Response};

/// Outbound HTTP. Any HTTP status is a resolved exchange; only transport
/// errors and timeouts are failures.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetworkFailure>;
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.clone())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetworkFailure> {
    let url = request.url.as_str();
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| NetworkFailure::new(url, format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| {
      let reason = if e.is_timeout() {
        "timed out".to_string()
      } else {
        e.to_string()
      };
      NetworkFailure::new(url, reason)
    })?;

    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.insert(name.as_str().to_lowercase(), value.to_string());
      }
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkFailure::new(url, format!("failed to read body: {}", e)))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
