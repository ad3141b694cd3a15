//! Request and response values crossing the interception boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Header marking a response served from cache after a network failure.
pub const FROM_CACHE_HEADER: &str = "from-cache";
/// Header marking a synthesized placeholder image.
pub const PLACEHOLDER_HEADER: &str = "x-placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }

  /// Methods that change remote state.
  pub fn is_mutating(&self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }
}

/// What the requesting page intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// Top-level navigation
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  Other,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub body: Option<Vec<u8>>,
  pub headers: BTreeMap<String, String>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Other,
      body: None,
      headers: BTreeMap::new(),
    }
  }

  pub fn get(url: &str) -> Result<Self, url::ParseError> {
    Ok(Self::new(Method::Get, Url::parse(url)?))
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
    self
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    self.body = Some(body);
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }

  /// Normalized cache key: the URL without its fragment.
  pub fn cache_key(&self) -> String {
    normalize_key(&self.url)
  }
}

/// Normalize a resource URL into a cache key.
pub fn normalize_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// A response, live or cached. Header names are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body,
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string().into_bytes())
      .with_header("Content-Type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// True when this is stale data served because the network failed.
  pub fn is_from_cache(&self) -> bool {
    self.header(FROM_CACHE_HEADER) == Some("true")
  }

  pub fn is_placeholder(&self) -> bool {
    self.header(PLACEHOLDER_HEADER) == Some("true")
  }

  pub fn json_body(&self) -> Option<serde_json::Value> {
    serde_json::from_slice(&self.body).ok()
  }
}
