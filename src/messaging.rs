//! Message channel between the replay worker and page contexts.
//!
//! Wire format (serde, tagged by `type`):
//! - page -> worker: `{"type":"SYNC_PENDING_REQUESTS"}`
//! - worker -> page: `{"type":"GET_AUTH_TOKEN"}` with a reply port, answered by `{"token":...}`
//! - worker -> page: `{"type":"REQUEST_SYNCED","url":...,"method":...,"success":...}`

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::http::HttpMethod;

/// Background sync tag that triggers a queue drain.
pub const SYNC_TAG: &str = "sync-pending-requests";

/// Messages a page posts to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SyncPendingRequests,
}

/// Messages the worker posts to pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
  GetAuthToken,
  RequestSynced(SyncNotice),
}

/// Outcome of one replayed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncNotice {
  pub url: String,
  pub method: HttpMethod,
  pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenReply {
  pub token: Option<String>,
}

/// A worker message plus the reply port, if one is expected.
#[derive(Debug)]
pub struct Envelope {
  pub message: PageMessage,
  pub reply_to: Option<mpsc::Sender<TokenReply>>,
}

/// Everything that wakes the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
  Message(WorkerMessage),
  /// Platform background-sync trigger carrying its registration tag
  Sync(String),
}

/// Page-side handle for posting to the worker and registering background sync.
///
/// Clones share one sender; `close` on any of them ends the worker's inbox
/// once the events already posted have been handled.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
  tx: Arc<Mutex<Option<mpsc::UnboundedSender<WorkerEvent>>>>,
}

impl WorkerHandle {
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Self {
      tx: Arc::new(Mutex::new(Some(tx))),
    };
    (handle, rx)
  }

  /// Returns false when the worker is gone or the handle was closed.
  pub fn post(&self, message: WorkerMessage) -> bool {
    self.send(WorkerEvent::Message(message))
  }

  pub fn register_sync(&self, tag: &str) -> bool {
    self.send(WorkerEvent::Sync(tag.to_string()))
  }

  pub fn close(&self) {
    self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
  }

  fn send(&self, event: WorkerEvent) -> bool {
    match self.tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
      Some(tx) => tx.send(event).is_ok(),
      None => false,
    }
  }
}


/// Worker-side registry of connected pages.
#[derive(Clone, Default)]
pub struct Clients {
  pages: Arc<Mutex<Vec<mpsc::UnboundedSender<Envelope>>>>,
  next_id: Arc<AtomicU64>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Connect a page; it receives worker messages on the returned inbox.
  pub fn connect(&self) -> (u64, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    self.lock().push(tx);
    (id, rx)
  }

  /// Number of pages still listening.
  pub fn count(&self) -> usize {
    let mut pages = self.lock();
    pages.retain(|page| !page.is_closed());
    pages.len()
  }

  /// Ask every page for the current credential; the first reply wins.
  ///
  /// Returns `None` when no page answers within `timeout`.
  pub async fn request_credential(&self, timeout: Duration) -> Option<String> {
    let pages = self.live_ports();
    if pages.is_empty() {
      return None;
    }

    let (reply_tx, mut reply_rx) = mpsc::channel(pages.len());
    let mut asked = 0;
    for page in &pages {
      let envelope = Envelope {
        message: PageMessage::GetAuthToken,
        reply_to: Some(reply_tx.clone()),
      };
      if page.send(envelope).is_ok() {
        asked += 1;
      }
    }
    drop(reply_tx);

    if asked == 0 {
      return None;
    }

    match tokio::time::timeout(timeout, reply_rx.recv()).await {
      Ok(Some(reply)) => reply.token,
      Ok(None) => None,
      Err(_) => {
        debug!(?timeout, "no page answered the credential request");
        None
      }
    }
  }

  /// Deliver a message to every connected page. Closed pages are skipped.
  pub fn broadcast(&self, message: PageMessage) -> usize {
    self
      .live_ports()
      .iter()
      .filter(|page| {
        page
          .send(Envelope {
            message: message.clone(),
            reply_to: None,
          })
          .is_ok()
      })
      .count()
  }

  fn live_ports(&self) -> Vec<mpsc::UnboundedSender<Envelope>> {
    let mut pages = self.lock();
    pages.retain(|page| !page.is_closed());
    pages.clone()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Envelope>>> {
    self.pages.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
