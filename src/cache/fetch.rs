//! Network boundary for the cache orchestrator.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use super::request::{Request, Response};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Network(String),
  #[error("request timed out")]
  Timeout,
  #[error("invalid request: {0}")]
  Invalid(String),
}

/// Performs a request against the network.
///
/// An `Ok` response may still carry an error status; only transport
/// failures are reported as `Err`.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// [`Fetch`] implementation over reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| FetchError::Invalid(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| FetchError::Invalid(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout
  } else if err.is_builder() {
    FetchError::Invalid(err.to_string())
  } else {
    FetchError::Network(err.to_string())
  }
}
