//! User-facing notifications (toasts and the offline indicator).
//!
//! Presentation lives outside this crate; the engine only calls `Notifier`.

use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Info,
  Success,
  Warning,
  Error,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Severity::Info => "info",
      Severity::Success => "success",
      Severity::Warning => "warning",
      Severity::Error => "error",
    };
    f.write_str(label)
  }
}

pub trait Notifier: Send + Sync {
  /// Show a transient message.
  fn notify(&self, message: &str, severity: Severity);

  /// Show or hide the persistent offline indicator.
  fn offline_indicator(&self, visible: bool);
}

/// Notifier that renders everything as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn notify(&self, message: &str, severity: Severity) {
    match severity {
      Severity::Info | Severity::Success => info!(%severity, "{}", message),
      Severity::Warning => warn!(%severity, "{}", message),
      Severity::Error => error!(%severity, "{}", message),
    }
  }

  fn offline_indicator(&self, visible: bool) {
    if visible {
      warn!("offline mode");
    } else {
      info!("back online");
    }
  }
}
