use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Header map with lowercase names.
pub type Headers = BTreeMap<String, String>;

/// HTTP methods the offline layer knows how to route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  #[default]
  Get,
  Post,
  Put,
  Delete,
}

impl HttpMethod {
  pub fn as_str(self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Delete => "DELETE",
    }
  }

  /// Methods that change server state and may be queued while offline.
  pub fn is_mutation(self) -> bool {
    matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Delete)
  }
}

impl fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for HttpMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(HttpMethod::Get),
      "POST" => Ok(HttpMethod::Post),
      "PUT" => Ok(HttpMethod::Put),
      "DELETE" => Ok(HttpMethod::Delete),
      other => Err(format!("unsupported method '{}'", other)),
    }
  }
}

/// Extract the path component of a request URL.
///
/// Relative URLs ("/api/rooms?page=2") are resolved against a placeholder
/// origin; query string and fragment never take part in the result.
pub fn resource_path(url: &str) -> String {
  let parsed = Url::parse("http://localhost/")
    .ok()
    .and_then(|base| Url::options().base_url(Some(&base)).parse(url).ok());

  match parsed {
    Some(u) => u.path().to_string(),
    None => url.split(['?', '#']).next().unwrap_or(url).to_string(),
  }
}

/// Per-call options accepted by the offline client, mirroring a plain fetch.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  /// Defaults to GET when omitted
  pub method: Option<HttpMethod>,
  pub headers: Headers,
  pub body: Option<String>,
  /// Set for page navigations (HTML documents)
  pub navigate: bool,
}

impl RequestOptions {
  pub fn into_request(self, url: &str) -> ApiRequest {
    let mut request = ApiRequest::new(self.method.unwrap_or_default(), url);
    for (name, value) in self.headers {
      request.set_header(&name, value);
    }
    request.body = self.body;
    request.navigate = self.navigate;
    request
  }
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  /// URL as given by the caller; may be relative to the API server
  pub url: String,
  pub method: HttpMethod,
  pub headers: Headers,
  pub body: Option<String>,
  pub navigate: bool,
}

impl ApiRequest {
  pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method,
      headers: Headers::new(),
      body: None,
      navigate: false,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(HttpMethod::Get, url)
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(mut self, body: &Value) -> Self {
    self.set_header("Content-Type", "application/json");
    self.body = Some(body.to_string());
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.set_header(name, value);
    self
  }

  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self
  }

  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn set_bearer(&mut self, token: &str) {
    self.set_header("Authorization", format!("Bearer {}", token));
  }

  /// Cache key for the path-keyed API data store.
  pub fn path(&self) -> String {
    resource_path(&self.url)
  }
}

/// A response obtained from the network or synthesized by the offline layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl ApiResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// Synthesize a JSON response.
  pub fn json(status: u16, body: &Value) -> Self {
    Self::new(status, body.to_string()).with_header("Content-Type", "application/json")
  }

  pub fn text(status: u16, body: &str) -> Self {
    Self::new(status, body).with_header("Content-Type", "text/plain")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn parse_json(&self) -> serde_json::Result<Value> {
    serde_json::from_slice(&self.body)
  }

  pub fn text_body(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
