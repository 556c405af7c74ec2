//! Application root: builds every service once and wires them together.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::connectivity::{
  Connectivity, ConnectivityMonitor, ManualSignal, ReachabilitySignal, TcpReachability,
};
use crate::http::{HttpTransport, Transport};
use crate::interceptor::OfflineClient;
use crate::messaging::{Clients, WorkerHandle};
use crate::notify::{Notifier, Severity, TracingNotifier};
use crate::page::{AuthSession, PageContext};
use crate::store::{OfflineStore, ResponseCaches, SqliteStore};
use crate::worker::{ReplayWorker, WorkerSettings};

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(3);

/// Collaborators the root needs from the outside world.
pub struct Platform<S> {
  pub store: Arc<S>,
  pub network: Arc<dyn Transport>,
  pub reachability: Arc<dyn ReachabilitySignal>,
  pub notifier: Arc<dyn Notifier>,
  pub session: AuthSession,
}

pub struct OfflineApp<S: OfflineStore + ResponseCaches + 'static> {
  pub store: Arc<S>,
  pub monitor: Arc<ConnectivityMonitor>,
  pub worker: Arc<ReplayWorker<S>>,
  pub page: Arc<PageContext>,
  pub client: OfflineClient<S>,
  notifier: Arc<dyn Notifier>,
  worker_task: JoinHandle<()>,
  page_tasks: Vec<JoinHandle<()>>,
}

impl OfflineApp<SqliteStore> {
  /// Build the application against the real network and on-disk store.
  pub async fn open(config: &Config, force_offline: bool) -> Result<Self> {
    let store = SqliteStore::open(&config.database_path()?)?
      .with_retention(config.retention.max_api_entries);
    let network = HttpTransport::new(&config.server)?;

    let reachability: Arc<dyn ReachabilitySignal> = if force_offline {
      Arc::new(ManualSignal::new(false))
    } else {
      Arc::new(TcpReachability::from_url(&config.server.url, REACHABILITY_TIMEOUT)?)
    };

    let platform = Platform {
      store: Arc::new(store),
      network: Arc::new(network),
      reachability,
      notifier: Arc::new(TracingNotifier),
      session: AuthSession::new(Config::get_api_token()),
    };

    Ok(Self::start(config, platform).await)
  }
}

impl<S: OfflineStore + ResponseCaches + 'static> OfflineApp<S> {
  /// Wire the services and start the worker and page tasks.
  pub async fn start(config: &Config, platform: Platform<S>) -> Self {
    let Platform {
      store,
      network,
      reachability,
      notifier,
      session,
    } = platform;

    let monitor = Arc::new(ConnectivityMonitor::start(reachability).await);
    if !monitor.is_online() {
      notifier.offline_indicator(true);
    }

    let clients = Clients::new();
    let worker = Arc::new(ReplayWorker::new(
      WorkerSettings::from(config),
      network,
      store.clone(),
      clients.clone(),
    ));
    worker.resume();

    let (handle, inbox) = WorkerHandle::channel();
    let page = Arc::new(PageContext::new(
      session.clone(),
      notifier.clone(),
      handle,
      monitor.clone(),
    ));

    // Page requests go through the worker, which passes them straight on
    // until it is activated
    let client = OfflineClient::new(
      worker.clone(),
      store.clone(),
      monitor.clone(),
      session,
      notifier.clone(),
    );

    let worker_task = worker.clone().spawn(inbox);
    let page_tasks = vec![
      page.attach(&clients),
      Self::watch_connectivity(&monitor, page.clone(), notifier.clone()),
    ];

    Self {
      store,
      monitor,
      worker,
      page,
      client,
      notifier,
      worker_task,
      page_tasks,
    }
  }

  /// Online: drop the indicator and drain. Offline: raise the indicator.
  fn watch_connectivity(
    monitor: &ConnectivityMonitor,
    page: Arc<PageContext>,
    notifier: Arc<dyn Notifier>,
  ) -> JoinHandle<()> {
    monitor.on_change(move |status| match status {
      Connectivity::Online => {
        notifier.offline_indicator(false);
        page.sync_pending_requests();
      }
      Connectivity::Offline => notifier.offline_indicator(true),
    })
  }

  /// Startup check: report queued requests and sync them when online.
  pub fn check_pending_requests(&self) -> usize {
    let count = match self.store.pending_count() {
      Ok(count) => count,
      Err(e) => {
        warn!(error = %e, "could not check pending requests");
        return 0;
      }
    };

    if count > 0 {
      info!(count, "found pending requests");
      self.notifier.notify(
        &format!("You have {} requests waiting for synchronization", count),
        Severity::Info,
      );
      self.page.sync_pending_requests();
    }
    count
  }

  /// Stop the page side, then let the worker handle everything already
  /// posted to it. A drain in progress always runs to completion.
  pub async fn shutdown(self) {
    for task in self.page_tasks {
      task.abort();
    }
    self.page.detach();

    if let Err(e) = self.worker_task.await {
      warn!(error = %e, "worker task ended abnormally");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{ApiRequest, HttpMethod};
  use crate::testing::{memory_store, MockTransport, RecordingNotifier};
  use serde_json::json;

  struct Fixture {
    app: OfflineApp<SqliteStore>,
    network: Arc<MockTransport>,
    signal: Arc<ManualSignal>,
    notifier: Arc<RecordingNotifier>,
  }

  async fn fixture(online: bool) -> Fixture {
    let network = MockTransport::new();
    network.set_reachable(online);
    let signal = Arc::new(ManualSignal::new(online));
    let notifier = Arc::new(RecordingNotifier::default());
    let platform = Platform {
      store: memory_store(),
      network: network.clone(),
      reachability: signal.clone(),
      notifier: notifier.clone(),
      session: AuthSession::new(Some("tok".to_string())),
    };
    let app = OfflineApp::start(&Config::default(), platform).await;
    Fixture {
      app,
      network,
      signal,
      notifier,
    }
  }

  #[tokio::test]
  async fn test_offline_post_then_reconnect_drains() {
    let f = fixture(false).await;
    assert_eq!(f.notifier.indicator_changes(), vec![true]);

    let response = f
      .app
      .client
      .send(ApiRequest::new(HttpMethod::Post, "/api/hedgehogs").with_json(&json!({"name": "Pino"})))
      .await
      .unwrap();
    assert_eq!(response.status, 202);
    assert_eq!(f.app.store.pending_count().unwrap(), 1);

    let mut synced = f.app.page.subscribe_synced();
    f.network.set_reachable(true);
    f.network
      .respond(HttpMethod::Post, "/api/hedgehogs", 201, json!({"id": 1}));
    f.signal.set_online(true);
    f.app.monitor.apply_signal(Connectivity::Online);

    let notice = tokio::time::timeout(Duration::from_secs(2), synced.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(notice.url, "/api/hedgehogs");
    assert_eq!(notice.method, HttpMethod::Post);
    assert!(notice.success);
    assert_eq!(f.app.store.pending_count().unwrap(), 0);
    assert_eq!(f.notifier.indicator_changes(), vec![true, false]);

    let replayed = f
      .network
      .requests()
      .into_iter()
      .filter(|r| r.method == HttpMethod::Post)
      .last()
      .unwrap();
    assert_eq!(replayed.body.as_deref(), Some(r#"{"name":"Pino"}"#));
    assert_eq!(replayed.header("authorization"), Some("Bearer tok"));
    f.app.shutdown().await;
  }

  #[tokio::test]
  async fn test_server_outage_serves_cached_rooms() {
    let f = fixture(true).await;
    let rooms = json!([{"id": 1, "name": "Nursery"}]);
    f.app.store.store_api_data("/api/rooms", &rooms).unwrap();
    f.network.fail(HttpMethod::Get, "/api/rooms");

    let response = f.app.client.send(ApiRequest::get("/api/rooms")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.parse_json().unwrap(), rooms);
    assert!(f.notifier.contains("Using cached data", Severity::Warning));
    f.app.shutdown().await;
  }

  #[tokio::test]
  async fn test_activated_worker_populates_api_data() {
    let f = fixture(true).await;
    let hedgehogs = json!([{"id": 1, "name": "Pino"}]);
    f.network
      .respond(HttpMethod::Get, "/api/hedgehogs", 200, hedgehogs.clone());
    f.app.worker.activate();

    f.app
      .client
      .send(ApiRequest::get("/api/hedgehogs"))
      .await
      .unwrap();

    assert_eq!(
      f.app.store.get_api_data("/api/hedgehogs").unwrap().unwrap().data,
      hedgehogs
    );
    // The worker asked the page for the credential
    assert_eq!(
      f.network.requests()[0].header("authorization"),
      Some("Bearer tok")
    );
    f.app.shutdown().await;
  }

  #[tokio::test]
  async fn test_startup_check_reports_pending() {
    let f = fixture(true).await;
    assert_eq!(f.app.check_pending_requests(), 0);

    f.app
      .store
      .enqueue_mutation(&crate::store::NewMutation::from_request(
        &ApiRequest::new(HttpMethod::Delete, "/api/rooms/4"),
        None,
      ))
      .unwrap();
    f.network.respond(HttpMethod::Delete, "/api/rooms/4", 204, json!(null));
    let mut synced = f.app.page.subscribe_synced();

    assert_eq!(f.app.check_pending_requests(), 1);
    assert!(f.notifier.contains("1 requests waiting", Severity::Info));

    let notice = tokio::time::timeout(Duration::from_secs(2), synced.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(notice.url, "/api/rooms/4");
    f.app.shutdown().await;
  }

  #[tokio::test]
  async fn test_cached_payload_keeps_server_bytes() {
    let f = fixture(true).await;
    let body = r#"{"name":"Pino","id":1,"weight":512.5,"room":{"name":"Nursery","area":2}}"#;
    f.network
      .respond_raw(HttpMethod::Get, "/api/hedgehogs/1", 200, body);
    f.app.worker.activate();
    f.app
      .client
      .send(ApiRequest::get("/api/hedgehogs/1"))
      .await
      .unwrap();

    // Same store, network gone: the interceptor serves from api data
    let offline = OfflineClient::new(
      MockTransport::unreachable(),
      f.app.store.clone(),
      Arc::new(ConnectivityMonitor::new(
        Connectivity::Offline,
        Arc::new(ManualSignal::new(false)),
      )),
      AuthSession::default(),
      Arc::new(RecordingNotifier::default()),
    );
    let response = offline
      .send(ApiRequest::get("/api/hedgehogs/1"))
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.text_body(), body);
    f.app.shutdown().await;
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_shutdown_finishes_posted_sync() {
    let f = fixture(true).await;
    f.app
      .store
      .enqueue_mutation(&crate::store::NewMutation::from_request(
        &ApiRequest::new(HttpMethod::Post, "/api/hedgehogs").with_body(r#"{"name":"Pino"}"#),
        Some("tok".to_string()),
      ))
      .unwrap();
    f.network
      .respond(HttpMethod::Post, "/api/hedgehogs", 201, json!({"id": 1}));
    f.network.set_delay(Duration::from_millis(100));
    let store = f.app.store.clone();

    assert_eq!(f.app.check_pending_requests(), 1);
    f.app.shutdown().await;

    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(f.network.request_count(), 1);
  }
}
