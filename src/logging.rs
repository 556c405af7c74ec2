//! Tracing initialization.
//!
//! Events go to a daily log file under the data directory. `--verbose` adds
//! a stderr layer. `RUST_LOG` overrides the default `info` filter.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install the global subscriber. Keep the guard alive until exit so
/// buffered lines are flushed.
pub fn init(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "laninna-offline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let stderr = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
