//! Offline-aware client that callers use instead of the raw transport.

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::http::{ApiRequest, ApiResponse, HttpMethod, RequestOptions, Transport, TransportError};
use crate::notify::{Notifier, Severity};
use crate::page::AuthSession;
use crate::store::{NewMutation, OfflineStore};

/// Header carrying the queue id on a deferred mutation's synthetic response.
pub const QUEUED_HEADER: &str = "x-offline-queued";

/// Errors surfaced to the caller. Each variant has its own user-facing wording.
#[derive(Debug, Error)]
pub enum RequestError {
  #[error("You are offline and {path} is not available in the cache")]
  OfflineNoCache { path: String },

  #[error("Server error: the server is unreachable ({source})")]
  ServerUnreachable {
    url: String,
    #[source]
    source: TransportError,
  },

  #[error("Could not save {method} {url} for sync: {reason}")]
  Store {
    method: HttpMethod,
    url: String,
    reason: String,
  },
}

/// Body of the synthetic response returned for a queued mutation.
pub fn queued_body() -> Value {
  json!({
    "success": true,
    "offline": true,
    "message": "Request queued for sync when online",
  })
}

/// Request interceptor: network first, then queue or cache depending on
/// method and connectivity.
pub struct OfflineClient<S: OfflineStore> {
  transport: Arc<dyn Transport>,
  store: Arc<S>,
  monitor: Arc<ConnectivityMonitor>,
  session: AuthSession,
  notifier: Arc<dyn Notifier>,
}

impl<S: OfflineStore> OfflineClient<S> {
  pub fn new(
    transport: Arc<dyn Transport>,
    store: Arc<S>,
    monitor: Arc<ConnectivityMonitor>,
    session: AuthSession,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    Self {
      transport,
      store,
      monitor,
      session,
      notifier,
    }
  }

  /// Drop-in replacement for a plain fetch.
  pub async fn request(
    &self,
    url: &str,
    options: RequestOptions,
  ) -> Result<ApiResponse, RequestError> {
    self.send(options.into_request(url)).await
  }

  pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, RequestError> {
    self.attach_credential(&mut request);

    match self.transport.send(request.clone()).await {
      // Any HTTP status is the caller's business
      Ok(response) => Ok(response),
      Err(error) => {
        warn!(method = %request.method, url = %request.url, %error, "request failed");
        self.handle_transport_failure(request, error).await
      }
    }
  }

  fn attach_credential(&self, request: &mut ApiRequest) {
    if request.header("authorization").is_some() {
      return;
    }
    if let Some(token) = self.session.token() {
      request.set_bearer(&token);
    }
  }

  async fn handle_transport_failure(
    &self,
    request: ApiRequest,
    error: TransportError,
  ) -> Result<ApiResponse, RequestError> {
    if self.monitor.recheck().await.is_online() {
      debug!(url = %request.url, "platform reports online, treating as server outage");
      self.serve_outage(request, error)
    } else {
      debug!(url = %request.url, "platform reports offline");
      self.serve_offline(request)
    }
  }

  fn serve_offline(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
    if request.method.is_mutation() {
      return self.defer(request);
    }

    let path = request.path();
    match self.cached_payload(&path) {
      Some(data) => Ok(ApiResponse::json(200, &data)),
      None => Err(RequestError::OfflineNoCache { path }),
    }
  }

  fn serve_outage(
    &self,
    request: ApiRequest,
    error: TransportError,
  ) -> Result<ApiResponse, RequestError> {
    if request.method == HttpMethod::Get {
      if let Some(data) = self.cached_payload(&request.path()) {
        info!(url = %request.url, "serving cached data while the server is unreachable");
        self.notifier.notify(
          "Using cached data while the server is unreachable",
          Severity::Warning,
        );
        return Ok(ApiResponse::json(200, &data));
      }
    }

    Err(RequestError::ServerUnreachable {
      url: request.url,
      source: error,
    })
  }

  fn defer(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
    let mutation = NewMutation::from_request(&request, self.session.token());

    let id = match self.store.enqueue_mutation(&mutation) {
      Ok(id) => id,
      Err(e) => {
        error!(method = %request.method, url = %request.url, error = %e, "could not queue request");
        self
          .notifier
          .notify("Request could not be saved for synchronization", Severity::Error);
        return Err(RequestError::Store {
          method: request.method,
          url: request.url,
          reason: e.to_string(),
        });
      }
    };

    info!(id, method = %request.method, url = %request.url, "request queued for sync");
    self
      .notifier
      .notify("Request saved for synchronization", Severity::Info);

    Ok(ApiResponse::json(202, &queued_body()).with_header(QUEUED_HEADER, id.to_string()))
  }

  /// Store failures degrade to a cache miss.
  fn cached_payload(&self, path: &str) -> Option<Value> {
    match self.store.get_api_data(path) {
      Ok(cached) => cached.map(|c| c.data),
      Err(e) => {
        warn!(path, error = %e, "api data lookup failed");
        None
      }
    }
  }
}

impl<S: OfflineStore> Clone for OfflineClient<S> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      store: Arc::clone(&self.store),
      monitor: Arc::clone(&self.monitor),
      session: self.session.clone(),
      notifier: Arc::clone(&self.notifier),
    }
  }
}
