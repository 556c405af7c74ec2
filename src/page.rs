//! Page-side context: holds the session credential and answers the worker.

use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connectivity::ConnectivityMonitor;
use crate::messaging::{
  Clients, Envelope, PageMessage, SyncNotice, TokenReply, WorkerHandle, WorkerMessage, SYNC_TAG,
};
use crate::notify::{Notifier, Severity};

/// The credential the page is currently logged in with.
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
  token: Arc<RwLock<Option<String>>>,
}

impl AuthSession {
  pub fn new(token: Option<String>) -> Self {
    Self {
      token: Arc::new(RwLock::new(token)),
    }
  }

  pub fn token(&self) -> Option<String> {
    self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn set_token(&self, token: Option<String>) {
    *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
  }
}

/// A page connected to the worker.
pub struct PageContext {
  session: AuthSession,
  notifier: Arc<dyn Notifier>,
  worker: WorkerHandle,
  monitor: Arc<ConnectivityMonitor>,
  synced: broadcast::Sender<SyncNotice>,
}

impl PageContext {
  pub fn new(
    session: AuthSession,
    notifier: Arc<dyn Notifier>,
    worker: WorkerHandle,
    monitor: Arc<ConnectivityMonitor>,
  ) -> Self {
    let (synced, _) = broadcast::channel(64);
    Self {
      session,
      notifier,
      worker,
      monitor,
      synced,
    }
  }

  pub fn session(&self) -> &AuthSession {
    &self.session
  }

  /// Connect to the worker and start answering its messages.
  pub fn attach(self: &Arc<Self>, clients: &Clients) -> JoinHandle<()> {
    let (id, inbox) = clients.connect();
    debug!(page = id, "page attached to worker");
    let page = Arc::clone(self);
    tokio::spawn(async move { page.listen(inbox).await })
  }

  async fn listen(&self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = inbox.recv().await {
      self.handle(envelope).await;
    }
  }

  async fn handle(&self, envelope: Envelope) {
    match envelope.message {
      PageMessage::GetAuthToken => {
        if let Some(reply) = envelope.reply_to {
          let _ = reply
            .send(TokenReply {
              token: self.session.token(),
            })
            .await;
        }
      }
      PageMessage::RequestSynced(notice) => {
        info!(url = %notice.url, method = %notice.method, "request synced");
        self
          .notifier
          .notify("Data synchronized successfully", Severity::Success);
        // Views that depend on the URL refresh from this stream
        let _ = self.synced.send(notice);
      }
    }
  }

  /// Stop posting to the worker. Events already posted are still handled.
  pub fn detach(&self) {
    debug!("page detached from worker");
    self.worker.close();
  }

  /// Sync notices received from the worker.
  pub fn subscribe_synced(&self) -> broadcast::Receiver<SyncNotice> {
    self.synced.subscribe()
  }

  /// Ask the worker to drain the queue and register the background sync.
  ///
  /// Does nothing while offline; returns whether the request was posted.
  pub fn sync_pending_requests(&self) -> bool {
    if !self.monitor.is_online() {
      return false;
    }

    let posted = self.worker.post(WorkerMessage::SyncPendingRequests);
    if !self.worker.register_sync(SYNC_TAG) {
      debug!("background sync registration failed");
    }
    posted
  }
}
