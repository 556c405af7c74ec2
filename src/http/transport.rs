//! Network transport seam and its reqwest implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::types::{ApiRequest, ApiResponse, Headers, HttpMethod};
use crate::config::ServerConfig;

/// No response could be obtained at all (DNS, connect, timeout).
///
/// HTTP error statuses are not transport errors; they come back as responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("request timed out")]
  Timeout,
  #[error("invalid request url '{0}'")]
  InvalidUrl(String),
}

/// Anything that can carry a request to the server.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
    (**self).send(request).await
  }
}

/// reqwest-backed transport resolving relative URLs against the API server.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(config: &ServerConfig) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", config.url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  fn resolve(&self, url: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(url)
      .map_err(|_| TransportError::InvalidUrl(url.to_string()))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
    let url = self.resolve(&request.url)?;
    let method = match request.method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await.map_err(classify)?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(classify)?.to_vec();

    Ok(ApiResponse {
      status,
      headers,
      body,
    })
  }
}

fn classify(error: reqwest::Error) -> TransportError {
  if error.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Connect(error.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn transport() -> HttpTransport {
    HttpTransport::new(&ServerConfig {
      url: "http://laninna.local:8080/".to_string(),
      request_timeout_secs: 5,
    })
    .unwrap()
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let transport = transport();
    assert_eq!(
      transport.resolve("/api/rooms?x=1").unwrap().as_str(),
      "http://laninna.local:8080/api/rooms?x=1"
    );
    assert_eq!(
      transport
        .resolve("https://cdn.tailwindcss.com")
        .unwrap()
        .as_str(),
      "https://cdn.tailwindcss.com/"
    );
  }

  #[test]
  fn test_invalid_server_url() {
    let result = HttpTransport::new(&ServerConfig {
      url: "not a url".to_string(),
      request_timeout_secs: 5,
    });
    assert!(result.is_err());
  }
}
