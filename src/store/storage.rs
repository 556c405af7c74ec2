//! Store traits and the SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::types::{CachedResource, MutationBody, NewMutation, PendingMutation};
use crate::http::{ApiResponse, Headers, HttpMethod};

/// Durable store for API data and the pending-mutation queue.
///
/// Every method is one transaction; callers never hold a copy of the store
/// beyond the value a call returns.
pub trait OfflineStore: Send + Sync {
  /// Cache a payload under its resource path, replacing any previous entry.
  fn store_api_data(&self, path: &str, data: &Value) -> Result<()>;

  /// Get the cached payload for a resource path.
  fn get_api_data(&self, path: &str) -> Result<Option<CachedResource>>;

  /// Append a mutation to the queue, returning its sequence id.
  fn enqueue_mutation(&self, mutation: &NewMutation) -> Result<i64>;

  /// All queued mutations in FIFO order.
  fn pending_mutations(&self) -> Result<Vec<PendingMutation>>;

  fn pending_count(&self) -> Result<usize>;

  /// Drop a mutation after the server acknowledged it.
  fn remove_mutation(&self, id: i64) -> Result<()>;

  /// Record a failed replay attempt and keep the entry queued.
  fn record_replay_failure(&self, id: i64, error: &str) -> Result<()>;
}

/// Named response caches used by the worker (static assets, data).
pub trait ResponseCaches: Send + Sync {
  fn put_response(&self, cache: &str, url: &str, response: &ApiResponse) -> Result<()>;

  fn match_response(&self, cache: &str, url: &str) -> Result<Option<ApiResponse>>;

  /// Look a URL up across every cache generation.
  fn match_any(&self, url: &str) -> Result<Option<ApiResponse>>;

  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a whole cache generation. Returns whether it existed.
  fn delete_cache(&self, cache: &str) -> Result<bool>;
}

/// SQLite-backed store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  max_api_entries: Option<usize>,
}

impl SqliteStore {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      max_api_entries: None,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Cap the number of API data entries; the oldest are evicted on write.
  pub fn with_retention(mut self, max_api_entries: Option<usize>) -> Self {
    self.max_api_entries = max_api_entries;
    self
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

const STORE_SCHEMA: &str = r#"
-- Last good payload per resource path
CREATE TABLE IF NOT EXISTS api_data (
    path TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_data_timestamp ON api_data(timestamp);

-- Mutations waiting for replay; AUTOINCREMENT keeps ids from being reused
CREATE TABLE IF NOT EXISTS pending_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    body TEXT,
    headers TEXT NOT NULL,
    token TEXT,
    timestamp INTEGER NOT NULL,
    last_error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0
);

-- Worker response caches, one generation per cache_name
CREATE TABLE IF NOT EXISTS response_cache (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, request_key)
);
"#;

impl OfflineStore for SqliteStore {
  fn store_api_data(&self, path: &str, data: &Value) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO api_data (path, data, timestamp) VALUES (?, ?, ?)",
      params![path, data.to_string(), Utc::now().timestamp_millis()],
    )
    .map_err(|e| eyre!("Failed to store api data for {}: {}", path, e))?;

    if let Some(limit) = self.max_api_entries {
      tx.execute(
        "DELETE FROM api_data WHERE path NOT IN (
           SELECT path FROM api_data ORDER BY timestamp DESC, path LIMIT ?
         )",
        params![limit as i64],
      )
      .map_err(|e| eyre!("Failed to evict api data: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_api_data(&self, path: &str) -> Result<Option<CachedResource>> {
    let conn = self.conn()?;

    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT data, timestamp FROM api_data WHERE path = ?",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read api data for {}: {}", path, e))?;

    match row {
      Some((data, timestamp)) => {
        let data: Value = serde_json::from_str(&data)
          .map_err(|e| eyre!("Corrupt api data for {}: {}", path, e))?;
        Ok(Some(CachedResource {
          path: path.to_string(),
          data,
          timestamp: from_millis(timestamp)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn enqueue_mutation(&self, mutation: &NewMutation) -> Result<i64> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let body = mutation.body.as_ref().map(MutationBody::to_wire);

    conn
      .execute(
        "INSERT INTO pending_requests (url, method, body, headers, token, timestamp)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          mutation.url,
          mutation.method.as_str(),
          body,
          headers,
          mutation.token,
          Utc::now().timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to queue {} {}: {}", mutation.method, mutation.url, e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, body, headers, token, timestamp, last_error, attempts
         FROM pending_requests ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (
      i64,
      String,
      String,
      Option<String>,
      String,
      Option<String>,
      i64,
      Option<String>,
      u32,
    );

    let rows: Vec<Row> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
          row.get(7)?,
          row.get(8)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending requests: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read pending request: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, url, method, body, headers, token, timestamp, last_error, attempts)| {
          let method: HttpMethod = method
            .parse()
            .map_err(|e| eyre!("Pending request {}: {}", id, e))?;
          let headers: Headers = serde_json::from_str(&headers)
            .map_err(|e| eyre!("Pending request {} has corrupt headers: {}", id, e))?;

          Ok(PendingMutation {
            id,
            url,
            method,
            body: body.as_deref().map(MutationBody::parse),
            headers,
            token,
            timestamp: from_millis(timestamp)?,
            last_error,
            attempts,
          })
        },
      )
      .collect()
  }

  fn pending_count(&self) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_requests", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count pending requests: {}", e))?;
    Ok(count as usize)
  }

  fn remove_mutation(&self, id: i64) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM pending_requests WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove pending request {}: {}", id, e))?;
    Ok(())
  }

  fn record_replay_failure(&self, id: i64, error: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE pending_requests SET last_error = ?, attempts = attempts + 1 WHERE id = ?",
        params![error, id],
      )
      .map_err(|e| eyre!("Failed to record failure for request {}: {}", id, e))?;
    Ok(())
  }
}

impl ResponseCaches for SqliteStore {
  fn put_response(&self, cache: &str, url: &str, response: &ApiResponse) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO response_cache
           (cache_name, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          cache,
          request_key(url),
          url,
          response.status,
          headers,
          response.body,
          Utc::now().timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to cache response for {}: {}", url, e))?;

    Ok(())
  }

  fn match_response(&self, cache: &str, url: &str) -> Result<Option<ApiResponse>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM response_cache
         WHERE cache_name = ? AND request_key = ?",
        params![cache, request_key(url)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached response for {}: {}", url, e))?;

    row.map(decode_response).transpose()
  }

  fn match_any(&self, url: &str) -> Result<Option<ApiResponse>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM response_cache
         WHERE request_key = ? ORDER BY cached_at DESC LIMIT 1",
        params![request_key(url)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached response for {}: {}", url, e))?;

    row.map(decode_response).transpose()
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM response_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list caches: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute(
        "DELETE FROM response_cache WHERE cache_name = ?",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;
    Ok(deleted > 0)
  }
}

/// SHA256 of the request URL, for stable fixed-length keys.
fn request_key(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

fn decode_response((status, headers, body): (u16, String, Vec<u8>)) -> Result<ApiResponse> {
  let headers: Headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Corrupt cached headers: {}", e))?;
  Ok(ApiResponse {
    status,
    headers,
    body,
  })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(millis).ok_or_else(|| eyre!("Invalid timestamp {}", millis))
}
