//! Offline-first write resilience for the meal planner client.
//!
//! Three components, composed bottom-up:
//! - [`cache::CacheOrchestrator`] answers intercepted requests from named,
//!   generation-versioned buckets (read resilience)
//! - [`queue::MutationQueue`] keeps write intent durable and replays it once a
//!   processor and connectivity are available (write resilience)
//! - [`save::SaveOrchestrator`] debounces local edits into remote saves and
//!   falls back to the queue when the network does not cooperate

pub mod cache;
pub mod config;
pub mod event;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod save;
pub mod storage;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock in-memory state, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
