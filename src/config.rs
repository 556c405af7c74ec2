use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "laninna-offline";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  /// Path prefixes served network-first and mirrored into the API data store
  #[serde(default = "default_data_endpoints")]
  pub data_endpoints: Vec<String>,
  /// Assets precached when the worker installs
  #[serde(default = "default_static_assets")]
  pub static_assets: Vec<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retention: RetentionConfig,
  /// Override for the SQLite database location
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server: ServerConfig::default(),
      data_endpoints: default_data_endpoints(),
      static_assets: default_static_assets(),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      retention: RetentionConfig::default(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8080/".to_string(),
      request_timeout_secs: default_request_timeout_secs(),
    }
  }
}

/// Names of the two response cache generations the worker keeps.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_static_cache")]
  pub static_name: String,
  #[serde(default = "default_data_cache")]
  pub data_name: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_name: default_static_cache(),
      data_name: default_data_cache(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// How long the worker waits for a page to hand over the credential
  #[serde(default = "default_credential_timeout_ms")]
  pub credential_timeout_ms: u64,
  /// Upper bound for a single replay attempt
  #[serde(default = "default_replay_timeout_secs")]
  pub replay_timeout_secs: u64,
}

impl SyncConfig {
  pub fn credential_timeout(&self) -> Duration {
    Duration::from_millis(self.credential_timeout_ms)
  }

  pub fn replay_timeout(&self) -> Duration {
    Duration::from_secs(self.replay_timeout_secs)
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      credential_timeout_ms: default_credential_timeout_ms(),
      replay_timeout_secs: default_replay_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionConfig {
  /// Keep at most this many API data entries (oldest evicted first).
  /// Unbounded when unset.
  pub max_api_entries: Option<usize>,
}

fn default_data_endpoints() -> Vec<String> {
  [
    "/api/hedgehogs",
    "/api/rooms",
    "/api/areas",
    "/api/therapies",
    "/api/weight-records",
    "/api/notifications",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_static_assets() -> Vec<String> {
  [
    "/",
    "/static/css/mobile.css",
    "/static/css/desktop.css",
    "/static/css/mobile-fixes.css",
    "/static/js/mobile.js",
    "/static/js/export.js",
    "/static/js/offline.js",
    "/login",
    "/hedgehogs",
    "/rooms",
    "/notifications",
    "/room-builder",
    "/tutorial",
    "https://cdn.tailwindcss.com",
    "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_static_cache() -> String {
  "laninna-static-v1".to_string()
}

fn default_data_cache() -> String {
  "laninna-data-v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
  30
}

fn default_credential_timeout_ms() -> u64 {
  500
}

fn default_replay_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./laninna-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/laninna-offline/config.yaml
  ///
  /// Falls back to defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("laninna-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join(APP_DIR))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("offline.db")),
    }
  }

  /// Get the API credential from the environment, if one is set.
  ///
  /// Checks LANINNA_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LANINNA_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_yaml_uses_defaults() {
    let config = Config::from_yaml("server:\n  url: https://laninna.example/\n").unwrap();
    assert_eq!(config.server.url, "https://laninna.example/");
    assert_eq!(config.server.request_timeout_secs, 30);
    assert_eq!(config.sync.credential_timeout(), Duration::from_millis(500));
    assert_eq!(config.data_endpoints.len(), 6);
    assert_eq!(config.cache.static_name, "laninna-static-v1");
    assert!(config.retention.max_api_entries.is_none());
    assert!(config
      .static_assets
      .iter()
      .any(|asset| asset == "https://cdn.tailwindcss.com"));
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
data_endpoints: ["/api/rooms"]
static_assets: []
cache:
  data_name: laninna-data-v2
sync:
  replay_timeout_secs: 5
retention:
  max_api_entries: 100
database: /tmp/offline.db
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.data_endpoints, vec!["/api/rooms".to_string()]);
    assert!(config.static_assets.is_empty());
    assert_eq!(config.cache.data_name, "laninna-data-v2");
    assert_eq!(config.cache.static_name, "laninna-static-v1");
    assert_eq!(config.sync.replay_timeout(), Duration::from_secs(5));
    assert_eq!(config.retention.max_api_entries, Some(100));
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/offline.db")
    );
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/laninna.yaml"))).is_err());
  }
}
