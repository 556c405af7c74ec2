//! Fetch routing: network-first for data endpoints, cache-first for assets.

use serde_json::json;
use tracing::{debug, warn};

use super::ReplayWorker;
use crate::http::{ApiRequest, ApiResponse, HttpMethod, TransportError};
use crate::store::{OfflineStore, ResponseCaches};

impl<S> ReplayWorker<S>
where
  S: OfflineStore + ResponseCaches + 'static,
{
  pub fn is_data_endpoint(&self, path: &str) -> bool {
    self
      .settings
      .data_endpoints
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
  }

  /// Handle a request issued by a controlled page.
  ///
  /// Only GETs are served from caches; mutations go straight to the network
  /// so a failure reaches the caller and can be queued there.
  pub async fn fetch(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
    if request.method != HttpMethod::Get {
      return self.transport.send(request).await;
    }

    if self.is_data_endpoint(&request.path()) {
      Ok(self.network_first(request).await)
    } else {
      Ok(self.cache_first(request).await)
    }
  }

  async fn network_first(&self, request: ApiRequest) -> ApiResponse {
    let token = self
      .clients
      .request_credential(self.settings.credential_timeout)
      .await;

    let mut authenticated = request.clone();
    if let Some(token) = token {
      authenticated.set_bearer(&token);
    }

    match self.transport.send(authenticated).await {
      Ok(response) => {
        if response.status == 200 {
          self.write_through(&request, &response);
        }
        response
      }
      Err(error) => {
        debug!(url = %request.url, %error, "network request failed, using cache");
        self.cached_data(&request)
      }
    }
  }

  fn write_through(&self, request: &ApiRequest, response: &ApiResponse) {
    if let Err(e) = self
      .store
      .put_response(&self.settings.data_cache, &request.url, response)
    {
      warn!(url = %request.url, error = %e, "failed to cache response");
    }

    match response.parse_json() {
      Ok(data) => {
        if let Err(e) = self.store.store_api_data(&request.path(), &data) {
          warn!(url = %request.url, error = %e, "failed to store api data");
        }
      }
      Err(e) => debug!(url = %request.url, error = %e, "response is not JSON, not stored"),
    }
  }

  fn cached_data(&self, request: &ApiRequest) -> ApiResponse {
    match self
      .store
      .match_response(&self.settings.data_cache, &request.url)
    {
      Ok(Some(cached)) => return cached,
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "data cache lookup failed"),
    }

    match self.store.get_api_data(&request.path()) {
      Ok(Some(cached)) => return ApiResponse::json(200, &cached.data),
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "api data lookup failed"),
    }

    // A JSON body keeps page-side parsing from failing on a network error
    ApiResponse::json(
      200,
      &json!({
        "offline": true,
        "message": "You are offline and this data is not cached",
      }),
    )
  }

  async fn cache_first(&self, request: ApiRequest) -> ApiResponse {
    if let Some(cached) = self.match_cached(&request.url) {
      return cached;
    }

    match self.transport.send(request.clone()).await {
      Ok(response) => {
        if response.status == 200 {
          if let Err(e) =
            self
              .store
              .put_response(&self.settings.static_cache, &request.url, &response)
          {
            warn!(url = %request.url, error = %e, "failed to cache asset");
          }
        }
        response
      }
      Err(error) => {
        warn!(url = %request.url, %error, "fetch failed");
        if request.navigate {
          if let Some(root) = self.match_cached("/") {
            return root;
          }
        }
        ApiResponse::text(503, "Network error occurred")
      }
    }
  }

  fn match_cached(&self, url: &str) -> Option<ApiResponse> {
    match self.store.match_any(url) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url, error = %e, "cache lookup failed");
        None
      }
    }
  }
}
