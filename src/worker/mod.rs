//! Background replay worker.
//!
//! Runs as its own task, independent of any page. It owns the network-first
//! path for the data endpoints, cache-first serving of static assets, and the
//! drain of the pending-mutation queue.
//!
//! Lifecycle:
//! 1. **install**: precache the static manifest, then activate right away
//! 2. **activate**: claim pages, drop cache generations that are not current
//! 3. **fetch** / **message** / **sync**: serve requests and drain the queue

mod fetch;
mod sync;

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::{ApiRequest, ApiResponse, Transport, TransportError};
use crate::messaging::{Clients, WorkerEvent, WorkerMessage, SYNC_TAG};
use crate::store::{OfflineStore, ResponseCaches};

pub use sync::DrainReport;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
}

/// Settings the worker needs from the application config.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub data_endpoints: Vec<String>,
  pub static_assets: Vec<String>,
  pub static_cache: String,
  pub data_cache: String,
  pub credential_timeout: Duration,
  pub replay_timeout: Duration,
}

impl From<&Config> for WorkerSettings {
  fn from(config: &Config) -> Self {
    Self {
      data_endpoints: config.data_endpoints.clone(),
      static_assets: config.static_assets.clone(),
      static_cache: config.cache.static_name.clone(),
      data_cache: config.cache.data_name.clone(),
      credential_timeout: config.sync.credential_timeout(),
      replay_timeout: config.sync.replay_timeout(),
    }
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: Vec<String>,
  pub failed: Vec<String>,
}

pub struct ReplayWorker<S> {
  settings: WorkerSettings,
  transport: Arc<dyn Transport>,
  store: Arc<S>,
  clients: Clients,
  state: Mutex<WorkerState>,
  drain_lock: tokio::sync::Mutex<()>,
  drain_requested: AtomicBool,
}

impl<S> ReplayWorker<S>
where
  S: OfflineStore + ResponseCaches + 'static,
{
  pub fn new(
    settings: WorkerSettings,
    transport: Arc<dyn Transport>,
    store: Arc<S>,
    clients: Clients,
  ) -> Self {
    Self {
      settings,
      transport,
      store,
      clients,
      state: Mutex::new(WorkerState::Parsed),
      drain_lock: tokio::sync::Mutex::new(()),
      drain_requested: AtomicBool::new(false),
    }
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: WorkerState) {
    debug!(?state, "worker state");
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Whether fetches from pages are routed through the worker.
  pub fn controls_pages(&self) -> bool {
    self.state() == WorkerState::Activated
  }

  /// Precache the static manifest and activate without waiting.
  ///
  /// A failing asset is logged and skipped; install still completes.
  pub async fn install(&self) -> InstallReport {
    info!("installing worker");
    self.set_state(WorkerState::Installing);

    let fetches = self.settings.static_assets.iter().map(|asset| async move {
      (asset, self.transport.send(ApiRequest::get(asset.as_str())).await)
    });

    let mut report = InstallReport::default();
    for (asset, result) in join_all(fetches).await {
      match result {
        Ok(response) if response.status == 200 => {
          match self
            .store
            .put_response(&self.settings.static_cache, asset, &response)
          {
            Ok(()) => report.cached.push(asset.clone()),
            Err(e) => {
              warn!(asset = %asset, error = %e, "failed to cache asset");
              report.failed.push(asset.clone());
            }
          }
        }
        Ok(response) => {
          warn!(asset = %asset, status = response.status, "asset not cached");
          report.failed.push(asset.clone());
        }
        Err(e) => {
          warn!(asset = %asset, error = %e, "asset fetch failed");
          report.failed.push(asset.clone());
        }
      }
    }

    self.set_state(WorkerState::Installed);
    info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "worker installed"
    );

    self.activate();
    report
  }

  /// Claim all pages and delete cache generations other than the current two.
  ///
  /// Returns the names of the deleted generations.
  pub fn activate(&self) -> Vec<String> {
    self.set_state(WorkerState::Activating);

    let names = match self.store.cache_names() {
      Ok(names) => names,
      Err(e) => {
        warn!(error = %e, "could not list caches");
        Vec::new()
      }
    };

    let mut removed = Vec::new();
    for name in names {
      if name == self.settings.static_cache || name == self.settings.data_cache {
        continue;
      }
      info!(cache = %name, "removing old cache");
      match self.store.delete_cache(&name) {
        Ok(_) => removed.push(name),
        Err(e) => warn!(cache = %name, error = %e, "failed to remove old cache"),
      }
    }

    self.set_state(WorkerState::Activated);
    removed
  }

  /// Re-activate a worker installed by an earlier run.
  ///
  /// The static cache generation surviving on disk marks a previous install.
  pub fn resume(&self) -> bool {
    let installed = self
      .store
      .cache_names()
      .map(|names| names.contains(&self.settings.static_cache))
      .unwrap_or(false);

    if installed {
      self.activate();
    }
    installed
  }

  /// Process messages and background-sync triggers until every sender is gone.
  pub fn spawn(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      while let Some(event) = inbox.recv().await {
        self.handle_event(event).await;
      }
      debug!("worker inbox closed");
    })
  }

  async fn handle_event(&self, event: WorkerEvent) {
    match event {
      WorkerEvent::Message(WorkerMessage::SyncPendingRequests) => {
        self.sync_pending_requests().await;
      }
      WorkerEvent::Sync(tag) if tag == SYNC_TAG => {
        self.sync_pending_requests().await;
      }
      WorkerEvent::Sync(tag) => debug!(%tag, "ignoring unknown sync tag"),
    }
  }
}

/// Pages controlled by the worker send their requests through it.
#[async_trait]
impl<S> Transport for ReplayWorker<S>
where
  S: OfflineStore + ResponseCaches + 'static,
{
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
    if !self.controls_pages() {
      return self.transport.send(request).await;
    }
    self.fetch(request).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::HttpMethod;
  use crate::store::SqliteStore;
  use crate::testing::{memory_store, MockTransport};
  use serde_json::json;

  pub(super) fn settings() -> WorkerSettings {
    WorkerSettings::from(&Config {
      static_assets: vec!["/".to_string(), "/static/css/mobile.css".to_string()],
      ..Config::default()
    })
  }

  pub(super) fn worker(
    transport: Arc<MockTransport>,
    store: Arc<SqliteStore>,
  ) -> Arc<ReplayWorker<SqliteStore>> {
    Arc::new(ReplayWorker::new(settings(), transport, store, Clients::new()))
  }

  #[tokio::test]
  async fn test_install_precaches_and_activates() {
    let transport = MockTransport::new();
    transport.respond(HttpMethod::Get, "/", 200, json!("<html>"));
    let store = memory_store();
    let worker = worker(transport, store.clone());

    assert!(!worker.controls_pages());
    let report = worker.install().await;

    assert_eq!(report.cached, vec!["/".to_string()]);
    assert_eq!(report.failed, vec!["/static/css/mobile.css".to_string()]);
    assert!(worker.controls_pages());
    assert!(store.match_response("laninna-static-v1", "/").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_activate_removes_stale_generations() {
    let store = memory_store();
    let page = ApiResponse::text(200, "old");
    store.put_response("laninna-cache-v1", "/", &page).unwrap();
    store.put_response("laninna-static-v1", "/", &page).unwrap();
    store.put_response("laninna-data-v1", "/api/rooms", &page).unwrap();

    let worker = worker(MockTransport::new(), store.clone());
    let removed = worker.activate();

    assert_eq!(removed, vec!["laninna-cache-v1".to_string()]);
    assert_eq!(
      store.cache_names().unwrap(),
      vec!["laninna-data-v1".to_string(), "laninna-static-v1".to_string()]
    );
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_resume_requires_previous_install() {
    let store = memory_store();
    let worker = worker(MockTransport::new(), store.clone());
    assert!(!worker.resume());
    assert!(!worker.controls_pages());

    store
      .put_response("laninna-static-v1", "/", &ApiResponse::text(200, "<html>"))
      .unwrap();
    assert!(worker.resume());
    assert!(worker.controls_pages());
  }

  #[tokio::test]
  async fn test_uncontrolled_worker_passes_through() {
    let transport = MockTransport::unreachable();
    let worker = worker(transport, memory_store());

    let result = worker.send(ApiRequest::get("/api/rooms")).await;
    assert!(result.is_err());
  }
}
