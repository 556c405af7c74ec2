mod app;
mod config;
mod connectivity;
mod http;
mod interceptor;
mod logging;
mod messaging;
mod notify;
mod page;
mod store;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;

use app::OfflineApp;
use http::{ApiResponse, HttpMethod, RequestOptions};
use store::OfflineStore;
use worker::DrainReport;

#[derive(Parser, Debug)]
#[command(name = "laninna-offline")]
#[command(about = "Offline request cache and replay engine for the La Ninna app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/laninna-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the network as unreachable
  #[arg(long, global = true)]
  offline: bool,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET a resource through the offline-aware client
  Get { url: String },
  /// Send a mutation; it is queued when offline
  Send {
    method: HttpMethod,
    url: String,
    /// Request body, sent as JSON when it parses as JSON
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Fetch a URL the way the worker serves a controlled page
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// List queued mutations
  Queue,
  /// Replay queued mutations now
  Sync,
  /// Precache static assets and activate the worker
  Install,
  /// Show connectivity, worker state and queue size
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  let config = config::Config::load(args.config.as_deref())?;
  let app = OfflineApp::open(&config, args.offline).await?;

  let result = run(&app, args.command).await;
  app.shutdown().await;
  result
}

async fn run(app: &OfflineApp<store::SqliteStore>, command: Command) -> Result<()> {
  match command {
    Command::Get { url } => {
      app.check_pending_requests();
      let response = app.client.request(&url, RequestOptions::default()).await?;
      print_response(&response);
    }
    Command::Send { method, url, body } => {
      if !method.is_mutation() {
        return Err(eyre!("{} is not a mutation, use `get`", method));
      }
      app.check_pending_requests();
      let mut headers = http::Headers::new();
      if let Some(text) = &body {
        if serde_json::from_str::<Value>(text).is_ok() {
          headers.insert("content-type".to_string(), "application/json".to_string());
        }
      }
      let options = RequestOptions {
        method: Some(method),
        headers,
        body,
        ..RequestOptions::default()
      };
      let response = app.client.request(&url, options).await?;
      print_response(&response);
    }
    Command::Fetch { url, navigate } => {
      let options = RequestOptions {
        navigate,
        ..RequestOptions::default()
      };
      let response = app.worker.fetch(options.into_request(&url)).await?;
      print_response(&response);
    }
    Command::Queue => {
      let pending = app.store.pending_mutations()?;
      println!("{}", serde_json::to_string_pretty(&pending)?);
    }
    Command::Sync => {
      if !app.monitor.is_online() {
        return Err(eyre!("Offline: queued requests are replayed once the server is reachable"));
      }
      let report = app.worker.sync_pending_requests().await;
      println!("{}", sync_summary(&report));
    }
    Command::Install => {
      let report = app.worker.install().await;
      println!("cached: {}, failed: {}", report.cached.len(), report.failed.len());
      for asset in &report.failed {
        println!("  not cached: {}", asset);
      }
    }
    Command::Status => {
      println!("connectivity: {}", app.monitor.current_status());
      println!("worker: {:?}", app.worker.state());
      println!("pending requests: {}", app.store.pending_count()?);
    }
  }

  Ok(())
}

fn sync_summary(report: &DrainReport) -> String {
  if report.coalesced {
    "a sync is already running; it will pick up the queued requests".to_string()
  } else {
    format!(
      "synced: {}, failed: {}",
      report.synced.len(),
      report.failed.len()
    )
  }
}

fn print_response(response: &ApiResponse) {
  println!("HTTP {}", response.status);
  match response.parse_json() {
    Ok(Value::Null) | Err(_) => println!("{}", response.text_body()),
    Ok(json) => match serde_json::to_string_pretty(&json) {
      Ok(pretty) => println!("{}", pretty),
      Err(_) => println!("{}", response.text_body()),
    },
  }
}
