//! Records kept by the durable store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::http::{ApiRequest, Headers, HttpMethod};

/// Last good payload for a resource path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResource {
  pub path: String,
  pub data: Value,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
}

/// Body of a queued mutation: parsed JSON when the caller sent valid JSON,
/// the raw text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MutationBody {
  Json(Value),
  Raw(String),
}

impl MutationBody {
  pub fn parse(raw: &str) -> Self {
    match serde_json::from_str(raw) {
      Ok(value) => MutationBody::Json(value),
      Err(_) => MutationBody::Raw(raw.to_string()),
    }
  }

  /// Text sent on the wire when the mutation is replayed.
  pub fn to_wire(&self) -> String {
    match self {
      MutationBody::Json(value) => value.to_string(),
      MutationBody::Raw(raw) => raw.clone(),
    }
  }

  pub fn as_json(&self) -> Option<&Value> {
    match self {
      MutationBody::Json(value) => Some(value),
      MutationBody::Raw(_) => None,
    }
  }
}

/// A mutation waiting to be replayed against the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
  /// Store-assigned sequence id, strictly increasing
  pub id: i64,
  pub url: String,
  pub method: HttpMethod,
  pub body: Option<MutationBody>,
  pub headers: Headers,
  /// Credential captured when the request was queued
  pub token: Option<String>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  pub attempts: u32,
}

/// A mutation about to be queued; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
  pub url: String,
  pub method: HttpMethod,
  pub body: Option<MutationBody>,
  pub headers: Headers,
  pub token: Option<String>,
}

impl NewMutation {
  pub fn from_request(request: &ApiRequest, token: Option<String>) -> Self {
    Self {
      url: request.url.clone(),
      method: request.method,
      body: request.body.as_deref().map(MutationBody::parse),
      headers: request.headers.clone(),
      token,
    }
  }
}
