//! Pending-mutation replay.

use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::ReplayWorker;
use crate::http::{ApiRequest, TransportError};
use crate::messaging::{PageMessage, SyncNotice};
use crate::store::{OfflineStore, PendingMutation, ResponseCaches};

/// Why a replay attempt did not go through. Recorded on the queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
  #[error("server answered HTTP {0}")]
  Status(u16),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("replay timed out after {0:?}")]
  TimedOut(Duration),
}

/// What a drain did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
  /// Ids replayed successfully and removed, in replay order
  pub synced: Vec<i64>,
  /// Ids that failed and stay queued
  pub failed: Vec<i64>,
  /// Another drain was running; this trigger was folded into it
  pub coalesced: bool,
}

impl<S> ReplayWorker<S>
where
  S: OfflineStore + ResponseCaches + 'static,
{
  /// Replay every queued mutation in FIFO order.
  ///
  /// Only one drain runs at a time. A trigger that arrives while a drain is
  /// running makes that drain do one more pass and returns immediately.
  pub async fn sync_pending_requests(&self) -> DrainReport {
    let mut report = DrainReport::default();
    self.drain_requested.store(true, Ordering::SeqCst);

    loop {
      let Ok(guard) = self.drain_lock.try_lock() else {
        debug!("drain already running, trigger coalesced");
        report.coalesced = true;
        return report;
      };

      while self.drain_requested.swap(false, Ordering::SeqCst) {
        self.drain_pass(&mut report).await;
      }
      drop(guard);

      // A trigger that raced with the release above
      if !self.drain_requested.load(Ordering::SeqCst) {
        break;
      }
    }

    report
  }

  async fn drain_pass(&self, report: &mut DrainReport) {
    let pending = match self.store.pending_mutations() {
      Ok(pending) => pending,
      Err(e) => {
        error!(error = %e, "could not read pending requests");
        return;
      }
    };

    if pending.is_empty() {
      return;
    }
    info!(count = pending.len(), "replaying pending requests");

    for mutation in pending {
      match self.replay(&mutation).await {
        Ok(()) => {
          if let Err(e) = self.store.remove_mutation(mutation.id) {
            error!(id = mutation.id, error = %e, "replayed request could not be removed");
          }
          info!(id = mutation.id, method = %mutation.method, url = %mutation.url, "synced pending request");
          self.clients.broadcast(PageMessage::RequestSynced(SyncNotice {
            url: mutation.url.clone(),
            method: mutation.method,
            success: true,
          }));
          report.synced.push(mutation.id);
        }
        Err(reason) => {
          warn!(id = mutation.id, url = %mutation.url, error = %reason, "replay failed");
          if let Err(e) = self
            .store
            .record_replay_failure(mutation.id, &reason.to_string())
          {
            error!(id = mutation.id, error = %e, "could not record replay failure");
          }
          report.failed.push(mutation.id);
        }
      }
    }
  }

  async fn replay(&self, mutation: &PendingMutation) -> Result<(), ReplayError> {
    let request = replay_request(mutation);
    let timeout = self.settings.replay_timeout;

    let response = tokio::time::timeout(timeout, self.transport.send(request))
      .await
      .map_err(|_| ReplayError::TimedOut(timeout))??;

    if response.is_success() {
      Ok(())
    } else {
      Err(ReplayError::Status(response.status))
    }
  }
}

/// Rebuild the original request with the credential captured at enqueue time.
fn replay_request(mutation: &PendingMutation) -> ApiRequest {
  let mut request = ApiRequest::new(mutation.method, mutation.url.as_str());
  request.headers = mutation.headers.clone();

  if let Some(body) = &mutation.body {
    if body.as_json().is_some() && request.header("content-type").is_none() {
      request.set_header("Content-Type", "application/json");
    }
    request.body = Some(body.to_wire());
  }

  if let Some(token) = &mutation.token {
    request.set_bearer(token);
  }

  request
}
