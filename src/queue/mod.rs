//! Durable, priority-ordered queue of pending writes.
//!
//! Items survive restarts through a [`DurableStore`], are replayed by the
//! processor registered for their routing key, and are retried with
//! exponential backoff until `max_attempts` is reached.

mod item;
mod matcher;
mod processor;

pub use item::{EnqueueOptions, MutationStatus, QueueStats, QueuedMutation};
pub use matcher::Matcher;
pub use processor::{processor_fn, FnProcessor, ProcessError, Processor};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::event::Connectivity;
use crate::lock;
use crate::storage::{load_json, store_json, DurableStore, StorageError};

const QUEUE_STORAGE_KEY: &str = "mutation-queue";
/// Where undecodable queue state is moved before starting empty
const QUARANTINE_KEY: &str = "mutation-queue.corrupt";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
  #[error("mutation queue is full ({capacity} active items)")]
  Full { capacity: usize },
  #[error("invalid processor pattern '{pattern}': {reason}")]
  InvalidPattern { pattern: String, reason: String },
  #[error("mutation {id} failed permanently: {reason}")]
  Exhausted { id: String, reason: String },
  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Notifications about item lifecycle, for orchestrators and UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Enqueued { id: String, key: String },
  Completed { id: String, key: String },
  /// Attempt failed, item is pending again
  Retrying {
    id: String,
    key: String,
    attempts: u32,
    error: String,
  },
  /// Item reached a terminal failure
  Failed {
    id: String,
    key: String,
    error: String,
  },
  /// Processor reported the item as no longer relevant
  Dropped { id: String, key: String },
}

impl QueueEvent {
  pub fn key(&self) -> &str {
    match self {
      QueueEvent::Enqueued { key, .. }
      | QueueEvent::Completed { key, .. }
      | QueueEvent::Retrying { key, .. }
      | QueueEvent::Failed { key, .. }
      | QueueEvent::Dropped { key, .. } => key,
    }
  }
}

type Pass = Shared<BoxFuture<'static, Result<(), QueueError>>>;

struct Registration {
  matcher: Matcher,
  processor: Arc<dyn Processor>,
}

/// Persistent mutation queue.
///
/// Cloning is cheap; all clones share the same items, processors and
/// in-flight pass.
#[derive(Clone)]
pub struct MutationQueue {
  inner: Arc<QueueInner>,
}

struct QueueInner {
  store: Arc<dyn DurableStore>,
  config: QueueConfig,
  connectivity: Connectivity,
  /// Sorted: active first, then priority desc, then creation asc
  items: Mutex<Vec<QueuedMutation>>,
  processors: Mutex<Vec<Registration>>,
  in_flight: Mutex<Option<Pass>>,
  events: broadcast::Sender<QueueEvent>,
  wake: Notify,
}

impl MutationQueue {
  /// Load the queue from `store`.
  ///
  /// Items left `processing` by an interrupted run are pending again. Corrupt
  /// state is quarantined and the queue starts empty; transient storage
  /// failures are returned.
  pub fn open(
    store: Arc<dyn DurableStore>,
    config: QueueConfig,
    connectivity: Connectivity,
  ) -> Result<Self, QueueError> {
    let mut items = load_items(store.as_ref())?;
    for item in &mut items {
      if item.status == MutationStatus::Processing {
        item.status = MutationStatus::Pending;
      }
    }
    sort_items(&mut items);

    let (events, _rx) = broadcast::channel(64);
    let queue = Self {
      inner: Arc::new(QueueInner {
        store,
        config,
        connectivity,
        items: Mutex::new(items),
        processors: Mutex::new(Vec::new()),
        in_flight: Mutex::new(None),
        events,
        wake: Notify::new(),
      }),
    };

    queue.cleanup_queue()?;
    debug!(items = lock(&queue.inner.items).len(), "mutation queue loaded");
    Ok(queue)
  }

  /// Add a mutation, returning its id.
  ///
  /// At capacity, completed and failed items are evicted oldest-first; if
  /// only active items remain the call fails with [`QueueError::Full`]. The
  /// item is durable before this returns.
  pub fn enqueue(
    &self,
    key: &str,
    payload: serde_json::Value,
    options: EnqueueOptions,
  ) -> Result<String, QueueError> {
    let capacity = self.inner.config.max_size;
    let mut items = lock(&self.inner.items);
    let mut next = items.clone();
    let mut created_at = Utc::now();

    let mut id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Some(pos) = next.iter().position(|item| item.id == id) {
      if next[pos].status == MutationStatus::Pending {
        created_at = next.remove(pos).created_at;
      } else {
        // Running and finished items keep their id and history
        let fresh = format!("{}-{}", id, Uuid::new_v4().simple());
        debug!(
          id = %id,
          fresh = %fresh,
          status = ?next[pos].status,
          "id is taken by a non-pending item, enqueueing under a fresh id"
        );
        id = fresh;
      }
    }

    if next.len() >= capacity {
      let evicted = evict_terminal(&mut next, capacity);
      if next.len() >= capacity {
        warn!(capacity, key, "mutation queue full of active items");
        return Err(QueueError::Full { capacity });
      }
      debug!(evicted, "evicted finished mutations to make room");
    }

    next.push(QueuedMutation {
      id: id.clone(),
      key: key.to_string(),
      payload,
      status: MutationStatus::Pending,
      attempts: 0,
      max_attempts: options
        .max_attempts
        .unwrap_or(self.inner.config.max_attempts)
        .max(1),
      created_at,
      last_attempt: None,
      last_error: None,
      priority: options.priority,
      next_attempt_at: None,
    });
    sort_items(&mut next);
    self.persist(&mut items, next)?;
    drop(items);

    debug!(id = %id, key, "enqueued mutation");
    self.emit(QueueEvent::Enqueued {
      id: id.clone(),
      key: key.to_string(),
    });
    self.inner.wake.notify_one();
    Ok(id)
  }

  /// Bind a processor to a key pattern (`*` and `?` wildcards).
  ///
  /// Registering the same pattern again replaces the earlier processor.
  pub fn register_processor<P: Processor + 'static>(
    &self,
    pattern: &str,
    processor: P,
  ) -> Result<(), QueueError> {
    self.register_shared_processor(pattern, Arc::new(processor))
  }

  pub fn register_shared_processor(
    &self,
    pattern: &str,
    processor: Arc<dyn Processor>,
  ) -> Result<(), QueueError> {
    let matcher = Matcher::new(pattern).map_err(|e| QueueError::InvalidPattern {
      pattern: pattern.to_string(),
      reason: e.to_string(),
    })?;

    let mut processors = lock(&self.inner.processors);
    match processors
      .iter_mut()
      .find(|registration| registration.matcher.pattern() == pattern)
    {
      Some(existing) => existing.processor = processor,
      None => processors.push(Registration { matcher, processor }),
    }
    debug!(pattern, "registered queue processor");
    Ok(())
  }

  /// Process every due pending item once, sequentially, in priority order.
  ///
  /// Concurrent callers share the pass already in flight. Item failures are
  /// recorded on the item; only storage failures are returned. Does nothing
  /// while offline.
  pub async fn process_queue(&self) -> Result<(), QueueError> {
    let pass = {
      let mut in_flight = lock(&self.inner.in_flight);
      let existing = in_flight.clone();
      match existing {
        Some(pass) => pass,
        None => {
          let queue = self.clone();
          let pass = async move {
            let result = queue.run_pass().await;
            lock(&queue.inner.in_flight).take();
            result
          }
          .boxed()
          .shared();
          *in_flight = Some(pass.clone());
          pass
        }
      }
    };
    pass.await
  }

  async fn run_pass(&self) -> Result<(), QueueError> {
    if !self.inner.connectivity.is_online() {
      debug!("offline, skipping queue processing");
      return Ok(());
    }

    let due: Vec<String> = {
      let now = Utc::now();
      let items = lock(&self.inner.items);
      let due = items
        .iter()
        .filter(|item| item.status == MutationStatus::Pending && item.is_due(now))
        .map(|item| item.id.clone())
        .collect();
      due
    };

    if !due.is_empty() {
      info!(count = due.len(), "processing queued mutations");
    }
    for id in due {
      if !self.inner.connectivity.is_online() {
        info!("connectivity lost, pausing queue processing");
        break;
      }
      self.process_item(&id).await?;
    }

    self.cleanup_queue()?;
    Ok(())
  }

  async fn process_item(&self, id: &str) -> Result<(), QueueError> {
    let item = {
      let items = lock(&self.inner.items);
      let item = items
        .iter()
        .find(|item| item.id == id && item.status == MutationStatus::Pending)
        .cloned();
      item
    };
    // Removed or replaced since the pass started
    let Some(item) = item else {
      return Ok(());
    };
    let key = item.key.clone();

    let Some(processor) = self.find_processor(&key) else {
      let reason = format!("No processor registered for key: {}", key);
      warn!(id, key = %key, "no processor registered, failing mutation");
      let failed = self.update(id, |entry| {
        entry.status = MutationStatus::Failed;
        entry.last_error = Some(reason.clone());
      })?;
      if failed.is_some() {
        self.emit(QueueEvent::Failed {
          id: id.to_string(),
          key,
          error: reason,
        });
      }
      return Ok(());
    };

    if !processor.validate(&item) {
      debug!(id, key = %key, "mutation no longer relevant, dropping");
      if self.remove_where(id, |_| true)? {
        self.emit(QueueEvent::Dropped {
          id: id.to_string(),
          key,
        });
      }
      return Ok(());
    }

    let original = item.payload.clone();
    let mut item = processor.transform(item);
    if !self.claim(id, &original, &item.payload)? {
      return Ok(());
    }
    item.status = MutationStatus::Processing;

    match processor.process(&item).await {
      Ok(()) => {
        let completed = self.update(id, |entry| {
          entry.status = MutationStatus::Completed;
          entry.last_error = None;
          entry.next_attempt_at = None;
        })?;
        if completed.is_some() {
          info!(id, key = %key, "queued mutation synced");
          self.emit(QueueEvent::Completed {
            id: id.to_string(),
            key,
          });
        }
      }
      Err(err) => {
        let reason = err.to_string();
        let config = &self.inner.config;
        let updated = self.update(id, |entry| {
          entry.attempts = (entry.attempts + 1).min(entry.max_attempts);
          entry.last_error = Some(reason.clone());
          if entry.attempts >= entry.max_attempts {
            entry.status = MutationStatus::Failed;
            entry.next_attempt_at = None;
          } else {
            entry.status = MutationStatus::Pending;
            entry.next_attempt_at = Some(Utc::now() + to_chrono(config.backoff(entry.attempts)));
          }
        })?;

        match updated {
          Some(entry) if entry.status == MutationStatus::Failed => {
            error!(id, key = %key, attempts = entry.attempts, error = %reason, "queued mutation failed permanently");
            self.emit(QueueEvent::Failed {
              id: id.to_string(),
              key,
              error: reason,
            });
          }
          Some(entry) => {
            warn!(
              id,
              key = %key,
              attempts = entry.attempts,
              max_attempts = entry.max_attempts,
              error = %reason,
              "queued mutation failed, will retry"
            );
            self.emit(QueueEvent::Retrying {
              id: id.to_string(),
              key,
              attempts: entry.attempts,
              error: reason,
            });
          }
          None => {}
        }
      }
    }
    Ok(())
  }

  /// Exact key registrations win over patterns; patterns match in
  /// registration order.
  fn find_processor(&self, key: &str) -> Option<Arc<dyn Processor>> {
    let processors = lock(&self.inner.processors);
    processors
      .iter()
      .find(|r| r.matcher.is_exact() && r.matcher.matches(key))
      .or_else(|| {
        processors
          .iter()
          .find(|r| !r.matcher.is_exact() && r.matcher.matches(key))
      })
      .map(|r| Arc::clone(&r.processor))
  }

  /// Mark a pending item as processing, unless it was replaced meanwhile.
  fn claim(
    &self,
    id: &str,
    original: &serde_json::Value,
    payload: &serde_json::Value,
  ) -> Result<bool, QueueError> {
    let mut items = lock(&self.inner.items);
    let mut next = items.clone();
    let Some(entry) = next.iter_mut().find(|item| item.id == id) else {
      return Ok(false);
    };
    if entry.status != MutationStatus::Pending || &entry.payload != original {
      return Ok(false);
    }
    entry.status = MutationStatus::Processing;
    entry.last_attempt = Some(Utc::now());
    entry.payload = payload.clone();
    self.persist(&mut items, next)?;
    Ok(true)
  }

  fn update(
    &self,
    id: &str,
    apply: impl FnOnce(&mut QueuedMutation),
  ) -> Result<Option<QueuedMutation>, QueueError> {
    let mut items = lock(&self.inner.items);
    let mut next = items.clone();
    let Some(entry) = next.iter_mut().find(|item| item.id == id) else {
      return Ok(None);
    };
    apply(entry);
    let updated = entry.clone();
    sort_items(&mut next);
    self.persist(&mut items, next)?;
    Ok(Some(updated))
  }

  fn remove_where(
    &self,
    id: &str,
    allowed: impl Fn(&QueuedMutation) -> bool,
  ) -> Result<bool, QueueError> {
    let mut items = lock(&self.inner.items);
    let Some(pos) = items.iter().position(|item| item.id == id) else {
      return Ok(false);
    };
    if !allowed(&items[pos]) {
      return Ok(false);
    }
    let mut next = items.clone();
    next.remove(pos);
    self.persist(&mut items, next)?;
    Ok(true)
  }

  /// Drop completed and failed items older than the retention window.
  /// Pending and processing items are kept regardless of age.
  pub fn cleanup_queue(&self) -> Result<usize, QueueError> {
    let cutoff = Utc::now() - self.inner.config.retention();
    let mut items = lock(&self.inner.items);
    let next: Vec<QueuedMutation> = items
      .iter()
      .filter(|item| item.status.is_active() || item.last_touched() > cutoff)
      .cloned()
      .collect();

    let removed = items.len() - next.len();
    if removed > 0 {
      self.persist(&mut items, next)?;
      debug!(removed, "cleaned up finished mutations");
    }
    Ok(removed)
  }

  pub fn get_queue_stats(&self) -> QueueStats {
    QueueStats::from_items(&lock(&self.inner.items))
  }

  /// True while any item is pending or processing.
  pub fn has_queued_items(&self) -> bool {
    lock(&self.inner.items)
      .iter()
      .any(|item| item.status.is_active())
  }

  pub fn get_item(&self, id: &str) -> Option<QueuedMutation> {
    lock(&self.inner.items)
      .iter()
      .find(|item| item.id == id)
      .cloned()
  }

  /// Most recently enqueued item routed to `key`, in any state.
  pub fn latest_for_key(&self, key: &str) -> Option<QueuedMutation> {
    lock(&self.inner.items)
      .iter()
      .filter(|item| item.key == key)
      .max_by_key(|item| item.created_at)
      .cloned()
  }

  /// The pending item routed to `key`, if any.
  pub fn pending_for_key(&self, key: &str) -> Option<QueuedMutation> {
    lock(&self.inner.items)
      .iter()
      .filter(|item| item.key == key && item.status == MutationStatus::Pending)
      .max_by_key(|item| item.created_at)
      .cloned()
  }

  /// Remove a pending item. Items in any other state are left alone.
  pub fn remove_item(&self, id: &str) -> Result<bool, QueueError> {
    let removed = self.remove_where(id, |item| item.status == MutationStatus::Pending)?;
    if removed {
      debug!(id, "removed queued mutation");
    }
    Ok(removed)
  }

  /// Remove every item. Returns how many were dropped.
  pub fn clear_queue(&self) -> Result<usize, QueueError> {
    let mut items = lock(&self.inner.items);
    let removed = items.len();
    self.persist(&mut items, Vec::new())?;
    info!(removed, "cleared mutation queue");
    Ok(removed)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.inner.events.subscribe()
  }

  /// Spawn the background task that replays the queue when connectivity
  /// returns, when items are enqueued, and when a backed-off item becomes
  /// due. Abort the handle to stop it.
  pub fn start_auto_processing(&self) -> JoinHandle<()> {
    let queue = self.clone();
    let mut online = self.inner.connectivity.subscribe();

    tokio::spawn(async move {
      loop {
        let due_in = if queue.inner.connectivity.is_online() {
          queue.next_due_in()
        } else {
          None
        };

        tokio::select! {
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            if !*online.borrow_and_update() {
              continue;
            }
            info!("connectivity restored, replaying queued mutations");
          }
          _ = queue.inner.wake.notified() => {}
          _ = sleep_for(due_in) => {}
        }

        if let Err(err) = queue.process_queue().await {
          warn!(error = %err, "queue processing failed");
          tokio::time::sleep(queue.inner.config.backoff(1)).await;
        }
      }
    })
  }

  /// Time until the earliest pending item may run.
  fn next_due_in(&self) -> Option<Duration> {
    let now = Utc::now();
    lock(&self.inner.items)
      .iter()
      .filter(|item| item.status == MutationStatus::Pending)
      .map(|item| item.next_attempt_at.unwrap_or(now))
      .min()
      .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
  }

  fn persist(
    &self,
    items: &mut Vec<QueuedMutation>,
    next: Vec<QueuedMutation>,
  ) -> Result<(), QueueError> {
    store_json(self.inner.store.as_ref(), QUEUE_STORAGE_KEY, &next)?;
    *items = next;
    Ok(())
  }

  fn emit(&self, event: QueueEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }
}

fn load_items(store: &dyn DurableStore) -> Result<Vec<QueuedMutation>, QueueError> {
  match load_json::<Vec<QueuedMutation>>(store, QUEUE_STORAGE_KEY) {
    Ok(items) => Ok(items.unwrap_or_default()),
    Err(StorageError::Corrupt(reason)) => {
      error!(%reason, "persisted mutation queue is corrupt, quarantining it and starting empty");
      if let Ok(Some(raw)) = store.get(QUEUE_STORAGE_KEY) {
        store.set(QUARANTINE_KEY, &raw)?;
      }
      store.remove(QUEUE_STORAGE_KEY)?;
      Ok(Vec::new())
    }
    Err(err) => Err(err.into()),
  }
}

/// Active items first, then priority descending, then oldest first.
fn sort_items(items: &mut [QueuedMutation]) {
  items.sort_by(|a, b| {
    b.status
      .is_active()
      .cmp(&a.status.is_active())
      .then(b.priority.cmp(&a.priority))
      .then(a.created_at.cmp(&b.created_at))
  });
}

/// Evict the oldest terminal items so one more item fits.
fn evict_terminal(items: &mut Vec<QueuedMutation>, capacity: usize) -> usize {
  let mut terminal: Vec<(DateTime<Utc>, String)> = items
    .iter()
    .filter(|item| item.status.is_terminal())
    .map(|item| (item.created_at, item.id.clone()))
    .collect();
  terminal.sort();

  let excess = items.len() + 1 - capacity;
  let evict: HashSet<String> = terminal
    .into_iter()
    .take(excess)
    .map(|(_, id)| id)
    .collect();
  items.retain(|item| !evict.contains(&item.id));
  evict.len()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
  chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

async fn sleep_for(delay: Option<Duration>) {
  match delay {
    Some(delay) => tokio::time::sleep(delay).await,
    None => std::future::pending::<()>().await,
  }
}
