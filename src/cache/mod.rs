//! Request-intercepting cache for read resilience.
//!
//! Every intercepted request is classified into a bucket class and answered
//! with the strategy for that class:
//! - static assets: cache-first
//! - images: cache-first with background revalidation, placeholder on failure
//! - api: network-first, stale cache tagged `From-Cache: true`, structured
//!   offline error otherwise
//! - everything else: network-first, offline page for navigations

mod fetch;
mod orchestrator;
mod request;

pub use fetch::{Fetch, FetchError, HttpFetcher};
pub use orchestrator::{BucketKind, CacheError, CacheOrchestrator, CacheSource, Phase, Served};
pub use request::{
  normalize_key, Destination, Method, Request, Response, FROM_CACHE_HEADER, PLACEHOLDER_HEADER,
};
