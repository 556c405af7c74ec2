//! Online/offline tracking.
//!
//! The monitor is the single source of truth for reachability. It is fed by
//! platform signals and checks the platform once at startup; it never polls.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  Offline,
}

impl Connectivity {
  pub fn from_online(online: bool) -> Self {
    if online {
      Connectivity::Online
    } else {
      Connectivity::Offline
    }
  }

  pub fn is_online(self) -> bool {
    self == Connectivity::Online
  }
}

impl fmt::Display for Connectivity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Connectivity::Online => f.write_str("online"),
      Connectivity::Offline => f.write_str("offline"),
    }
  }
}

/// Platform network-reachability signal.
#[async_trait]
pub trait ReachabilitySignal: Send + Sync {
  async fn is_online(&self) -> bool;
}

/// Reachability by opening a TCP connection to the API host.
pub struct TcpReachability {
  host: String,
  port: u16,
  timeout: Duration,
}

impl TcpReachability {
  pub fn from_url(url: &str, timeout: Duration) -> Result<Self> {
    let parsed = Url::parse(url).map_err(|e| eyre!("Invalid server url '{}': {}", url, e))?;
    let host = parsed
      .host_str()
      .ok_or_else(|| eyre!("Server url '{}' has no host", url))?
      .to_string();
    let port = parsed
      .port_or_known_default()
      .ok_or_else(|| eyre!("Server url '{}' has no port", url))?;

    Ok(Self {
      host,
      port,
      timeout,
    })
  }
}

#[async_trait]
impl ReachabilitySignal for TcpReachability {
  async fn is_online(&self) -> bool {
    let connect = TcpStream::connect((self.host.as_str(), self.port));
    matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
  }
}

/// Signal whose value is set by hand (forced offline mode, tests).
#[derive(Debug)]
pub struct ManualSignal {
  online: AtomicBool,
}

impl ManualSignal {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

#[async_trait]
impl ReachabilitySignal for ManualSignal {
  async fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

/// Tracks the current connectivity state and notifies on transitions.
pub struct ConnectivityMonitor {
  signal: Arc<dyn ReachabilitySignal>,
  online: AtomicBool,
  changes: broadcast::Sender<Connectivity>,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity, signal: Arc<dyn ReachabilitySignal>) -> Self {
    let (changes, _) = broadcast::channel(16);
    Self {
      signal,
      online: AtomicBool::new(initial.is_online()),
      changes,
    }
  }

  /// Create a monitor initialized from one explicit platform check.
  pub async fn start(signal: Arc<dyn ReachabilitySignal>) -> Self {
    let initial = Connectivity::from_online(signal.is_online().await);
    info!(status = %initial, "initial connectivity");
    Self::new(initial, signal)
  }

  pub fn current_status(&self) -> Connectivity {
    Connectivity::from_online(self.online.load(Ordering::SeqCst))
  }

  pub fn is_online(&self) -> bool {
    self.current_status().is_online()
  }

  /// Receive one event per genuine transition.
  pub fn subscribe(&self) -> broadcast::Receiver<Connectivity> {
    self.changes.subscribe()
  }

  /// Invoke `listener` once per transition until the monitor is dropped.
  pub fn on_change<F>(&self, listener: F) -> JoinHandle<()>
  where
    F: Fn(Connectivity) + Send + 'static,
  {
    let mut rx = self.subscribe();
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(status) => listener(status),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "connectivity listener lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }

  /// Apply a platform signal. Returns true when it caused a transition;
  /// a repeated signal for the current state is ignored.
  pub fn apply_signal(&self, status: Connectivity) -> bool {
    let previous = self.online.swap(status.is_online(), Ordering::SeqCst);
    if previous == status.is_online() {
      debug!(status = %status, "redundant connectivity signal");
      return false;
    }

    info!(status = %status, "connectivity changed");
    // No subscribers is fine
    let _ = self.changes.send(status);
    true
  }

  /// Ask the platform for its current reachability and apply the answer.
  pub async fn recheck(&self) -> Connectivity {
    let status = Connectivity::from_online(self.signal.is_online().await);
    self.apply_signal(status);
    status
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn monitor(online: bool) -> (Arc<ManualSignal>, ConnectivityMonitor) {
    let signal = Arc::new(ManualSignal::new(online));
    let monitor = ConnectivityMonitor::new(Connectivity::from_online(online), signal.clone());
    (signal, monitor)
  }

  #[tokio::test]
  async fn test_start_checks_platform_once() {
    let signal = Arc::new(ManualSignal::new(false));
    let monitor = ConnectivityMonitor::start(signal).await;
    assert_eq!(monitor.current_status(), Connectivity::Offline);
  }

  #[tokio::test]
  async fn test_redundant_signals_are_suppressed() {
    let (_signal, monitor) = monitor(true);
    let mut rx = monitor.subscribe();

    assert!(!monitor.apply_signal(Connectivity::Online));
    assert!(monitor.apply_signal(Connectivity::Offline));
    assert!(!monitor.apply_signal(Connectivity::Offline));
    assert!(monitor.apply_signal(Connectivity::Online));

    assert_eq!(rx.recv().await.unwrap(), Connectivity::Offline);
    assert_eq!(rx.recv().await.unwrap(), Connectivity::Online);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_recheck_follows_platform() {
    let (signal, monitor) = monitor(true);
    signal.set_online(false);

    assert_eq!(monitor.recheck().await, Connectivity::Offline);
    assert!(!monitor.is_online());
  }

  #[tokio::test]
  async fn test_on_change_listener() {
    let (_signal, monitor) = monitor(false);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _handle = monitor.on_change(move |status| {
      let _ = tx.send(status);
    });

    monitor.apply_signal(Connectivity::Online);
    monitor.apply_signal(Connectivity::Online);

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap();
    assert_eq!(received, Some(Connectivity::Online));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_tcp_reachability_uses_default_port() {
    let signal = TcpReachability::from_url("https://laninna.example/", Duration::from_secs(1)).unwrap();
    assert_eq!(signal.host, "laninna.example");
    assert_eq!(signal.port, 443);
  }
}
