//! Classifies intercepted requests and answers them from generation-versioned
//! buckets, falling back to placeholders or structured offline bodies when
//! both cache and network come up empty.

use serde_json::json;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::Fetch;
use super::request::{Method, Request, Response, FROM_CACHE_HEADER, PLACEHOLDER_HEADER};
use crate::config::CacheConfig;
use crate::lock;
use crate::storage::{BucketStore, StorageError};

const IMAGE_EXTENSIONS: &[&str] = &[
  ".png", ".jpg", ".jpeg", ".gif", ".webp", ".avif", ".svg", ".ico",
];

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#f3f4f6"/><text x="100" y="105" font-family="sans-serif" font-size="14" fill="#9ca3af" text-anchor="middle">Image unavailable</text></svg>"##;

const OFFLINE_HTML: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You're offline</h1><p>This page isn't available offline yet. It will load once you reconnect.</p></body></html>";

/// Resource class of a request; each class has its own bucket and strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
  /// Build output and manifest entries, cache-first
  Static,
  /// Cache-first with background revalidation
  Image,
  /// Own data endpoints, network-first with tagged stale fallback
  Api,
  /// Everything else, network-first
  Dynamic,
}

impl BucketKind {
  pub const ALL: [BucketKind; 4] = [
    BucketKind::Static,
    BucketKind::Image,
    BucketKind::Api,
    BucketKind::Dynamic,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      BucketKind::Static => "static",
      BucketKind::Image => "image",
      BucketKind::Api => "api",
      BucketKind::Dynamic => "dynamic",
    }
  }
}

/// Lifecycle of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Installing,
  Installed,
  /// Old generations cleaned up, all pages controlled
  Active,
}

/// Indicates how a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Served from cache while a background refetch refreshes the entry
  CacheRevalidating,
  /// Network failed, cached copy returned and tagged `From-Cache`
  StaleFallback,
  Placeholder,
  OfflinePage,
  OfflineError,
}

/// A response plus the path that produced it.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
  pub bucket: BucketKind,
}

impl Served {
  fn new(response: Response, source: CacheSource, bucket: BucketKind) -> Self {
    Self {
      response,
      source,
      bucket,
    }
  }
}

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to precache {url}: {reason}")]
  Precache { url: String, reason: String },
  #[error("invalid cache url '{0}'")]
  InvalidUrl(String),
  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Request-intercepting cache with per-class strategies.
///
/// `handle` never fails: every path ends in a live response, a cached one, a
/// placeholder image, an offline page or a structured offline error body.
pub struct CacheOrchestrator<S: BucketStore> {
  inner: Arc<Inner<S>>,
}

struct Inner<S: BucketStore> {
  store: Arc<S>,
  fetcher: Arc<dyn Fetch>,
  config: CacheConfig,
  origin: Url,
  /// Precache manifest resolved against the origin
  manifest: Vec<Url>,
  phase: Mutex<Phase>,
  revalidations: Mutex<JoinSet<()>>,
}

impl<S: BucketStore + 'static> CacheOrchestrator<S> {
  pub fn new(
    store: Arc<S>,
    fetcher: Arc<dyn Fetch>,
    origin: Url,
    config: CacheConfig,
  ) -> Result<Self, CacheError> {
    let manifest = config
      .precache
      .iter()
      .map(|path| origin.join(path).map_err(|_| CacheError::InvalidUrl(path.clone())))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      inner: Arc::new(Inner {
        store,
        fetcher,
        config,
        origin,
        manifest,
        phase: Mutex::new(Phase::Installing),
        revalidations: Mutex::new(JoinSet::new()),
      }),
    })
  }

  pub fn phase(&self) -> Phase {
    *lock(&self.inner.phase)
  }

  pub fn store(&self) -> &S {
    &self.inner.store
  }

  /// Bucket name for a class in the current generation.
  pub fn bucket_name(&self, kind: BucketKind) -> String {
    format!(
      "{}-{}-{}",
      self.inner.config.name_prefix,
      kind.as_str(),
      self.inner.config.generation
    )
  }

  pub fn expected_buckets(&self) -> Vec<String> {
    BucketKind::ALL
      .iter()
      .map(|kind| self.bucket_name(*kind))
      .collect()
  }

  /// Fetch the precache manifest into the static bucket.
  ///
  /// All-or-nothing: if any manifest entry fails nothing is stored. On
  /// success the orchestrator is ready to activate immediately.
  pub async fn install(&self) -> Result<usize, CacheError> {
    *lock(&self.inner.phase) = Phase::Installing;
    let bucket = self.bucket_name(BucketKind::Static);

    let mut fetched = Vec::with_capacity(self.inner.manifest.len());
    for url in &self.inner.manifest {
      let request = Request::new(Method::Get, url.clone());
      let response = self
        .inner
        .fetcher
        .fetch(&request)
        .await
        .map_err(|e| CacheError::Precache {
          url: url.to_string(),
          reason: e.to_string(),
        })?;
      if !response.is_success() {
        return Err(CacheError::Precache {
          url: url.to_string(),
          reason: format!("status {}", response.status),
        });
      }
      fetched.push((request.cache_key(), response));
    }

    for (key, response) in &fetched {
      self.inner.store.put(&bucket, key, response)?;
    }

    *lock(&self.inner.phase) = Phase::Installed;
    info!(
      count = fetched.len(),
      bucket = %bucket,
      "precached static assets, activating without waiting"
    );
    Ok(fetched.len())
  }

  /// Delete every bucket outside the current generation and take control.
  ///
  /// Returns the names of deleted buckets.
  pub fn activate(&self) -> Result<Vec<String>, CacheError> {
    let expected = self.expected_buckets();
    let mut deleted = Vec::new();

    for name in self.inner.store.bucket_names()? {
      if expected.contains(&name) {
        continue;
      }
      if self.inner.store.delete_bucket(&name)? {
        info!(bucket = %name, "deleted stale cache bucket");
        deleted.push(name);
      }
    }

    *lock(&self.inner.phase) = Phase::Active;
    info!(generation = %self.inner.config.generation, "cache active, controlling all pages");
    Ok(deleted)
  }

  /// Decide the resource class of a request. First match wins.
  pub fn classify(&self, request: &Request) -> BucketKind {
    let config = &self.inner.config;
    let same_origin = request.url.origin() == self.inner.origin.origin();
    let path = request.url.path();

    if same_origin
      && (self.is_manifest_entry(request)
        || config
          .static_prefixes
          .iter()
          .any(|prefix| path.starts_with(prefix.as_str())))
    {
      return BucketKind::Static;
    }

    if request.destination == super::Destination::Image || is_image_path(config, path) {
      return BucketKind::Image;
    }

    if same_origin && path.starts_with(config.api_prefix.as_str()) {
      return BucketKind::Api;
    }

    BucketKind::Dynamic
  }

  fn is_manifest_entry(&self, request: &Request) -> bool {
    let key = request.cache_key();
    self
      .inner
      .manifest
      .iter()
      .any(|url| super::request::normalize_key(url) == key)
  }

  /// Answer an intercepted request.
  pub async fn handle(&self, request: &Request) -> Response {
    self.serve(request).await.response
  }

  /// Answer an intercepted request, reporting which path produced the response.
  pub async fn serve(&self, request: &Request) -> Served {
    let kind = self.classify(request);
    debug!(method = request.method.as_str(), url = %request.url, bucket = kind.as_str(), "intercepted request");

    match kind {
      BucketKind::Static if request.method == Method::Get => {
        self.cache_first(request, kind).await
      }
      BucketKind::Image if request.method == Method::Get => {
        self.stale_while_revalidate(request, kind).await
      }
      _ => self.network_first(request, kind).await,
    }
  }

  /// Wait for all background revalidations started so far.
  pub async fn settle(&self) {
    let mut tasks = std::mem::take(&mut *lock(&self.inner.revalidations));
    while tasks.join_next().await.is_some() {}
  }

  async fn cache_first(&self, request: &Request, kind: BucketKind) -> Served {
    let key = request.cache_key();
    if let Some(cached) = self.cached(kind, &key) {
      debug!(url = %request.url, "cache hit");
      return Served::new(cached, CacheSource::Cache, kind);
    }

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(kind, &key, &response);
        }
        Served::new(response, CacheSource::Network, kind)
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "cache miss and network failed");
        self.offline_fallback(request, kind)
      }
    }
  }

  async fn stale_while_revalidate(&self, request: &Request, kind: BucketKind) -> Served {
    let key = request.cache_key();
    if let Some(cached) = self.cached(kind, &key) {
      self.revalidate_in_background(request.clone(), kind);
      return Served::new(cached, CacheSource::CacheRevalidating, kind);
    }

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(kind, &key, &response);
        }
        Served::new(response, CacheSource::Network, kind)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "image unavailable, serving placeholder");
        Served::new(placeholder_image(), CacheSource::Placeholder, kind)
      }
    }
  }

  async fn network_first(&self, request: &Request, kind: BucketKind) -> Served {
    let key = request.cache_key();
    let cacheable = request.method == Method::Get;

    match self.inner.fetcher.fetch(request).await {
      Ok(response) => {
        if cacheable && response.is_success() {
          self.remember(kind, &key, &response);
        }
        Served::new(response, CacheSource::Network, kind)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "network failed, trying cache");
        if cacheable {
          if let Some(cached) = self.cached(kind, &key) {
            return Served::new(
              cached.with_header(FROM_CACHE_HEADER, "true"),
              CacheSource::StaleFallback,
              kind,
            );
          }
        }
        self.offline_fallback(request, kind)
      }
    }
  }

  fn revalidate_in_background(&self, request: Request, kind: BucketKind) {
    let inner = Arc::clone(&self.inner);
    let bucket = self.bucket_name(kind);
    let key = request.cache_key();

    let mut tasks = lock(&self.inner.revalidations);
    // Reap finished refreshes so the set does not grow without bound
    while tasks.try_join_next().is_some() {}
    tasks.spawn(async move {
      match inner.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(err) = inner.store.put(&bucket, &key, &response) {
            debug!(url = %request.url, error = %err, "failed to store revalidated entry");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation returned error status");
        }
        Err(err) => {
          debug!(url = %request.url, error = %err, "background revalidation failed");
        }
      }
    });
  }

  fn offline_fallback(&self, request: &Request, kind: BucketKind) -> Served {
    if request.is_navigation() {
      return self.offline_page(kind);
    }
    Served::new(
      offline_error(request.method),
      CacheSource::OfflineError,
      kind,
    )
  }

  fn offline_page(&self, kind: BucketKind) -> Served {
    let cached = self
      .inner
      .origin
      .join(&self.inner.config.offline_page)
      .ok()
      .and_then(|url| self.cached(BucketKind::Static, &super::request::normalize_key(&url)));

    let response = cached.unwrap_or_else(|| {
      Response::new(503, OFFLINE_HTML.as_bytes().to_vec())
        .with_header("Content-Type", "text/html; charset=utf-8")
    });
    Served::new(response, CacheSource::OfflinePage, kind)
  }

  /// Cache lookup that degrades storage failures to a miss.
  fn cached(&self, kind: BucketKind, key: &str) -> Option<Response> {
    match self.inner.store.lookup(&self.bucket_name(kind), key) {
      Ok(hit) => hit,
      Err(err) => {
        warn!(key, error = %err, "cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn remember(&self, kind: BucketKind, key: &str, response: &Response) {
    if let Err(err) = self.inner.store.put(&self.bucket_name(kind), key, response) {
      warn!(key, error = %err, "failed to cache response");
    }
  }
}

impl<S: BucketStore> Clone for CacheOrchestrator<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

fn is_image_path(config: &CacheConfig, path: &str) -> bool {
  let lower = path.to_ascii_lowercase();
  config
    .image_prefixes
    .iter()
    .any(|prefix| lower.starts_with(prefix.as_str()))
    || IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_SVG.as_bytes().to_vec())
    .with_header("Content-Type", "image/svg+xml")
    .with_header(PLACEHOLDER_HEADER, "true")
}

/// Structured 503 body for requests nothing could answer.
fn offline_error(method: Method) -> Response {
  let body = if method.is_mutating() {
    json!({
      "error": "Offline",
      "message": "You are offline. This change was not sent; retry once you are back online.",
      "retry": true,
    })
  } else {
    json!({
      "error": "Offline",
      "message": "You are offline and this content is not available in the cache.",
      "cached": false,
    })
  };
  Response::json(503, &body)
}
