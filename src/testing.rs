//! Test doubles shared by the module tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::http::{resource_path, ApiRequest, ApiResponse, HttpMethod, Transport, TransportError};
use crate::notify::{Notifier, Severity};
use crate::store::{CachedResource, NewMutation, OfflineStore, PendingMutation, SqliteStore};

#[derive(Debug, Clone)]
pub enum MockReply {
  Json(u16, Value),
  /// Body bytes exactly as the server would send them
  Raw(u16, String),
  Fail,
}

/// Scripted server. Replies per (method, path) are consumed in order and
/// the last one repeats; unknown routes answer 404.
#[derive(Default)]
pub struct MockTransport {
  routes: Mutex<HashMap<(HttpMethod, String), VecDeque<MockReply>>>,
  requests: Mutex<Vec<ApiRequest>>,
  unreachable: AtomicBool,
  delay: Mutex<Option<Duration>>,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Every request fails at the transport level.
  pub fn unreachable() -> Arc<Self> {
    let transport = Self::new();
    transport.set_reachable(false);
    transport
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.unreachable.store(!reachable, Ordering::SeqCst);
  }

  pub fn respond(&self, method: HttpMethod, path: &str, status: u16, body: Value) {
    self.push(method, path, MockReply::Json(status, body));
  }

  pub fn respond_raw(&self, method: HttpMethod, path: &str, status: u16, body: &str) {
    self.push(method, path, MockReply::Raw(status, body.to_string()));
  }

  /// Answer every request only after `delay`.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn fail(&self, method: HttpMethod, path: &str) {
    self.push(method, path, MockReply::Fail);
  }

  fn push(&self, method: HttpMethod, path: &str, reply: MockReply) {
    self
      .routes
      .lock()
      .unwrap()
      .entry((method, path.to_string()))
      .or_default()
      .push_back(reply);
  }

  pub fn requests(&self) -> Vec<ApiRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for MockTransport {
  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
    self.requests.lock().unwrap().push(request.clone());

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.unreachable.load(Ordering::SeqCst) {
      return Err(TransportError::Connect("network unreachable".to_string()));
    }

    let reply = {
      let mut routes = self.routes.lock().unwrap();
      routes
        .get_mut(&(request.method, resource_path(&request.url)))
        .and_then(|replies| {
          if replies.len() > 1 {
            replies.pop_front()
          } else {
            replies.front().cloned()
          }
        })
    };

    match reply {
      Some(MockReply::Json(status, body)) => Ok(ApiResponse::json(status, &body)),
      Some(MockReply::Raw(status, body)) => Ok(
        ApiResponse::new(status, body.into_bytes()).with_header("content-type", "application/json"),
      ),
      Some(MockReply::Fail) => Err(TransportError::Connect("connection reset".to_string())),
      None => Ok(ApiResponse::json(404, &json!({"error": "not found"}))),
    }
  }
}

/// Notifier that remembers everything it was asked to show.
#[derive(Default)]
pub struct RecordingNotifier {
  messages: Mutex<Vec<(String, Severity)>>,
  indicator: Mutex<Vec<bool>>,
}

impl RecordingNotifier {
  pub fn messages(&self) -> Vec<(String, Severity)> {
    self.messages.lock().unwrap().clone()
  }

  pub fn contains(&self, needle: &str, severity: Severity) -> bool {
    self
      .messages()
      .iter()
      .any(|(message, s)| *s == severity && message.contains(needle))
  }

  pub fn indicator_changes(&self) -> Vec<bool> {
    self.indicator.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn notify(&self, message: &str, severity: Severity) {
    self
      .messages
      .lock()
      .unwrap()
      .push((message.to_string(), severity));
  }

  fn offline_indicator(&self, visible: bool) {
    self.indicator.lock().unwrap().push(visible);
  }
}

pub fn memory_store() -> Arc<SqliteStore> {
  Arc::new(SqliteStore::open_in_memory().unwrap())
}

/// Store whose every operation fails.
pub struct BrokenStore;

impl OfflineStore for BrokenStore {
  fn store_api_data(&self, _path: &str, _data: &Value) -> Result<()> {
    Err(eyre!("disk full"))
  }

  fn get_api_data(&self, _path: &str) -> Result<Option<CachedResource>> {
    Err(eyre!("disk full"))
  }

  fn enqueue_mutation(&self, _mutation: &NewMutation) -> Result<i64> {
    Err(eyre!("disk full"))
  }

  fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
    Err(eyre!("disk full"))
  }

  fn pending_count(&self) -> Result<usize> {
    Err(eyre!("disk full"))
  }

  fn remove_mutation(&self, _id: i64) -> Result<()> {
    Err(eyre!("disk full"))
  }

  fn record_replay_failure(&self, _id: i64, _error: &str) -> Result<()> {
    Err(eyre!("disk full"))
  }
}
