//! Per-entity save state machine.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler::{Conflict, SaveFailure, SaveHandler};
use super::state::{SaveNotice, SaveState, SaveStatus};
use crate::config::SaveConfig;
use crate::event::{Connectivity, PageEvent, PageEvents};
use crate::lock;
use crate::queue::{
  EnqueueOptions, MutationQueue, MutationStatus, ProcessError, Processor, QueueError,
  QueuedMutation,
};
use crate::storage::{load_json, store_json, DurableStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
  /// Local validation blocked the save; the message is shown as is
  #[error("{0}")]
  Validation(String),
  #[error("save failed: {0}")]
  Remote(SaveFailure),
  #[error("conflict resolution failed: {0}")]
  Conflict(SaveFailure),
  #[error(transparent)]
  Queue(#[from] QueueError),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error("could not serialize entity: {0}")]
  Serialization(String),
}

/// Data an orchestrator can manage.
pub trait Editable: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Editable for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Process-wide collaborators shared by every orchestrator.
#[derive(Clone)]
pub struct SaveContext {
  pub queue: MutationQueue,
  pub connectivity: Connectivity,
  /// Where recovery backups live
  pub recovery: Arc<dyn DurableStore>,
}

#[derive(Debug, Clone)]
pub struct SaveOptions {
  /// Identifies the entity, e.g. "recipe-42"
  pub storage_key: String,
  /// Operation name appended to the queue key
  pub operation: String,
  pub debounce: Duration,
  /// Attempts for queued replays
  pub max_attempts: u32,
  pub priority: i32,
  /// Compare remote version markers before saving
  pub conflict_detection: bool,
}

impl SaveOptions {
  pub fn new(storage_key: impl Into<String>) -> Self {
    Self::from_config(storage_key, &SaveConfig::default())
  }

  pub fn from_config(storage_key: impl Into<String>, config: &SaveConfig) -> Self {
    Self {
      storage_key: storage_key.into(),
      operation: "save".to_string(),
      debounce: Duration::from_millis(config.debounce_ms),
      max_attempts: config.max_attempts,
      priority: config.priority,
      conflict_detection: false,
    }
  }

  pub fn with_debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  pub fn with_conflict_detection(mut self) -> Self {
    self.conflict_detection = true;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  /// Routing key and id of this entity's queued save.
  pub fn queue_key(&self) -> String {
    format!("{}:{}", self.storage_key, self.operation)
  }

  fn recovery_key(&self) -> String {
    format!("recovery:{}", self.storage_key)
  }
}

struct Entity<T> {
  current: T,
  /// Last snapshot known to be persisted remotely
  saved: T,
  base_version: Option<String>,
  state: SaveState,
  last_error: Option<String>,
  notice: Option<SaveNotice>,
  recovery_attempts: u32,
  /// Dropping the sender cancels the pending debounce timer
  debounce: Option<oneshot::Sender<()>>,
  timer_seq: u64,
}

impl<T: PartialEq> Entity<T> {
  fn has_pending_changes(&self) -> bool {
    self.current != self.saved
  }

  fn status(&self) -> SaveStatus {
    SaveStatus {
      state: self.state,
      has_pending_changes: self.has_pending_changes(),
      last_error: self.last_error.clone(),
      notice: self.notice,
      recovery_attempts: self.recovery_attempts,
    }
  }

  fn cancel_debounce(&mut self) {
    self.debounce = None;
    self.timer_seq += 1;
  }
}

struct Core<T: Editable> {
  handler: Arc<dyn SaveHandler<T>>,
  queue: MutationQueue,
  connectivity: Connectivity,
  recovery: Arc<dyn DurableStore>,
  options: SaveOptions,
  queue_key: String,
  entity: Mutex<Entity<T>>,
  /// Serializes save attempts; edits never wait on it
  save_lock: tokio::sync::Mutex<()>,
  status_tx: broadcast::Sender<SaveStatus>,
}

/// Save state machine for one editable entity.
///
/// Must be used from within a tokio runtime: edits schedule debounce timers
/// on it.
pub struct SaveOrchestrator<T: Editable> {
  core: Arc<Core<T>>,
  listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Editable> SaveOrchestrator<T> {
  /// Mount an entity whose last persisted value is `initial`.
  ///
  /// Registers the replay processor for this entity's queue key. A save left
  /// in the queue by an earlier run is picked up as pending local data.
  pub fn new(
    initial: T,
    handler: Arc<dyn SaveHandler<T>>,
    ctx: &SaveContext,
    options: SaveOptions,
  ) -> Result<Self, SaveError> {
    let queue_key = options.queue_key();
    let mut entity = Entity {
      current: initial.clone(),
      saved: initial,
      base_version: None,
      state: SaveState::Idle,
      last_error: None,
      notice: None,
      recovery_attempts: 0,
      debounce: None,
      timer_seq: 0,
    };

    if let Some(item) = ctx.queue.latest_for_key(&queue_key) {
      match item.status {
        MutationStatus::Pending | MutationStatus::Processing => {
          entity.state = SaveState::OfflineQueued
        }
        MutationStatus::Failed => {
          entity.state = SaveState::Error;
          entity.last_error = item.last_error.clone();
        }
        MutationStatus::Completed => {}
      }
      if item.status != MutationStatus::Completed {
        match serde_json::from_value::<T>(item.payload) {
          Ok(queued) => entity.current = queued,
          Err(err) => warn!(key = %queue_key, error = %err, "queued save does not decode, ignoring it"),
        }
      }
    }

    let (status_tx, _rx) = broadcast::channel(32);
    let core = Arc::new(Core {
      handler: Arc::clone(&handler),
      queue: ctx.queue.clone(),
      connectivity: ctx.connectivity.clone(),
      recovery: Arc::clone(&ctx.recovery),
      options,
      queue_key: queue_key.clone(),
      entity: Mutex::new(entity),
      save_lock: tokio::sync::Mutex::new(()),
      status_tx,
    });

    ctx.queue.register_processor(
      &queue_key,
      ReplayProcessor {
        core: Arc::downgrade(&core),
        handler,
      },
    )?;
    debug!(key = %queue_key, "save orchestrator mounted");

    Ok(Self {
      core,
      listeners: Mutex::new(Vec::new()),
    })
  }

  /// Record a local edit.
  ///
  /// Values equal to the last saved snapshot never dirty the entity; an edit
  /// that returns to it cancels the pending save, queued or not.
  pub fn update_data(&self, data: T) {
    let core = &self.core;
    let mut entity = lock(&core.entity);
    if data == entity.current {
      return;
    }

    if data == entity.saved {
      entity.current = data;
      entity.cancel_debounce();
      let discarded = core.discard_queued();
      match entity.state {
        SaveState::Dirty | SaveState::Error => {
          entity.state = SaveState::Idle;
          entity.last_error = None;
        }
        SaveState::OfflineQueued if discarded => {
          entity.state = SaveState::Idle;
          entity.notice = None;
        }
        _ => {}
      }
    } else {
      entity.current = data;
      if entity.state != SaveState::Saving {
        entity.state = SaveState::Dirty;
      }
      entity.notice = None;
      core.schedule(&mut entity);
    }

    core.write_recovery(&mut entity);
    core.emit(&entity);
  }

  /// Save now, bypassing the debounce. Errors are returned to the caller.
  pub async fn manual_save(&self) -> Result<(), SaveError> {
    self.core.save_now().await
  }

  pub async fn force_save(&self) -> Result<(), SaveError> {
    self.core.save_now().await
  }

  /// Drain the queue for this entity, re-arming an exhausted save first.
  ///
  /// Fails with [`QueueError::Exhausted`] when the save still cannot go
  /// through.
  pub async fn retry_failed_saves(&self) -> Result<(), SaveError> {
    let core = &self.core;
    let failed = core
      .queue
      .latest_for_key(&core.queue_key)
      .is_some_and(|item| item.status == MutationStatus::Failed);
    let pending = lock(&core.entity).has_pending_changes();

    if failed && pending {
      let data = lock(&core.entity).current.clone();
      core.enqueue(&data)?;
    }

    core.queue.process_queue().await?;

    match core.queue.latest_for_key(&core.queue_key) {
      Some(item) if item.status == MutationStatus::Failed => {
        Err(SaveError::Queue(QueueError::Exhausted {
          id: item.id,
          reason: item.last_error.unwrap_or_default(),
        }))
      }
      _ => Ok(()),
    }
  }

  /// Whether leaving the page should prompt the user.
  pub fn before_unload(&self) -> bool {
    self.core.unload_blocked()
  }

  /// Last edited value from the recovery backup, saved or not.
  pub fn get_recovery_data(&self) -> Result<Option<T>, SaveError> {
    Ok(load_json(
      self.core.recovery.as_ref(),
      &self.core.options.recovery_key(),
    )?)
  }

  pub fn clear_recovery_data(&self) -> Result<(), SaveError> {
    self
      .core
      .recovery
      .remove(&self.core.options.recovery_key())?;
    Ok(())
  }

  /// Version marker the current local data was loaded from.
  pub fn set_base_version(&self, version: Option<String>) {
    lock(&self.core.entity).base_version = version;
  }

  pub fn base_version(&self) -> Option<String> {
    lock(&self.core.entity).base_version.clone()
  }

  /// Force-save when the page is hidden with unsaved changes, and publish the
  /// current status on unload so the host can prompt.
  pub fn attach(&self, page: &PageEvents) {
    let mut events = page.subscribe();
    let core = Arc::downgrade(&self.core);

    let handle = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(PageEvent::Hidden) => {
            let Some(core) = core.upgrade() else {
              break;
            };
            {
              let entity = lock(&core.entity);
              if !entity.has_pending_changes() || entity.state == SaveState::Saving {
                continue;
              }
            }
            debug!(key = %core.queue_key, "page hidden with unsaved changes, saving");
            tokio::spawn(async move {
              if let Err(err) = core.save_now().await {
                warn!(key = %core.queue_key, error = %err, "save on page hide failed");
              }
            });
          }
          Ok(PageEvent::BeforeUnload) => {
            let Some(core) = core.upgrade() else {
              break;
            };
            if core.unload_blocked() {
              core.emit(&lock(&core.entity));
            }
          }
          Err(RecvError::Lagged(_)) => continue,
          Err(RecvError::Closed) => break,
        }
      }
    });
    lock(&self.listeners).push(handle);
  }

  /// Cancel the pending debounce and release listeners. Does not save.
  pub fn detach(&self) {
    lock(&self.core.entity).cancel_debounce();
    for handle in lock(&self.listeners).drain(..) {
      handle.abort();
    }
    debug!(key = %self.core.queue_key, "save orchestrator detached");
  }

  pub fn status(&self) -> SaveStatus {
    lock(&self.core.entity).status()
  }

  pub fn state(&self) -> SaveState {
    lock(&self.core.entity).state
  }

  pub fn has_pending_changes(&self) -> bool {
    lock(&self.core.entity).has_pending_changes()
  }

  pub fn data(&self) -> T {
    lock(&self.core.entity).current.clone()
  }

  pub fn saved_data(&self) -> T {
    lock(&self.core.entity).saved.clone()
  }

  pub fn queue_key(&self) -> &str {
    &self.core.queue_key
  }

  /// Status snapshots on every transition.
  pub fn subscribe(&self) -> broadcast::Receiver<SaveStatus> {
    self.core.status_tx.subscribe()
  }
}

impl<T: Editable> Drop for SaveOrchestrator<T> {
  fn drop(&mut self) {
    self.detach();
  }
}

impl<T: Editable> Core<T> {
  fn emit(&self, entity: &Entity<T>) {
    let _ = self.status_tx.send(entity.status());
  }

  /// Restart the debounce timer. The previous timer is cancelled by dropping
  /// its sender.
  fn schedule(self: &Arc<Self>, entity: &mut Entity<T>) {
    entity.timer_seq += 1;
    let seq = entity.timer_seq;
    let (tx, rx) = oneshot::channel::<()>();
    entity.debounce = Some(tx);

    let core = Arc::downgrade(self);
    let delay = self.options.debounce;
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = rx => return,
      }
      let Some(core) = core.upgrade() else {
        return;
      };
      {
        let mut entity = lock(&core.entity);
        if entity.timer_seq != seq {
          return;
        }
        entity.debounce = None;
      }
      // Background path: failures only show up in the state
      if let Err(err) = core.save_now().await {
        debug!(key = %core.queue_key, error = %err, "debounced save did not complete");
      }
    });
  }

  fn unload_blocked(&self) -> bool {
    let pending = lock(&self.entity).has_pending_changes();
    if pending {
      info!(key = %self.options.storage_key, "unsaved changes at unload");
    }
    pending
  }

  /// Drop this entity's queued save if no attempt has started on it.
  fn discard_queued(&self) -> bool {
    let Some(item) = self.queue.pending_for_key(&self.queue_key) else {
      return false;
    };
    match self.queue.remove_item(&item.id) {
      Ok(removed) => {
        if removed {
          debug!(key = %self.queue_key, id = %item.id, "discarded superseded queued save");
        }
        removed
      }
      Err(err) => {
        warn!(key = %self.queue_key, error = %err, "could not discard queued save");
        false
      }
    }
  }

  fn write_recovery(&self, entity: &mut Entity<T>) {
    match store_json(
      self.recovery.as_ref(),
      &self.options.recovery_key(),
      &entity.current,
    ) {
      Ok(()) => entity.recovery_attempts = 0,
      Err(err) => {
        entity.recovery_attempts += 1;
        warn!(
          key = %self.options.storage_key,
          attempts = entity.recovery_attempts,
          error = %err,
          "failed to write recovery backup"
        );
      }
    }
  }

  async fn save_now(self: &Arc<Self>) -> Result<(), SaveError> {
    let _saving = self.save_lock.lock().await;

    let data = {
      let mut entity = lock(&self.entity);
      entity.cancel_debounce();

      if !entity.has_pending_changes() {
        entity.state = SaveState::Saved;
        entity.last_error = None;
        self.emit(&entity);
        return Ok(());
      }

      if let Some(message) = self.handler.validate(&entity.current).message() {
        debug!(key = %self.queue_key, %message, "validation blocked save");
        entity.state = SaveState::Error;
        entity.last_error = Some(message.clone());
        self.emit(&entity);
        return Err(SaveError::Validation(message));
      }
      entity.current.clone()
    };

    if !self.connectivity.is_online() {
      debug!(key = %self.queue_key, "offline, queueing save");
      return self.enqueue(&data);
    }

    // The direct save carries newer data than anything still queued
    self.discard_queued();

    {
      let mut entity = lock(&self.entity);
      entity.state = SaveState::Saving;
      entity.last_error = None;
      entity.notice = None;
      self.emit(&entity);
    }

    match self.commit(data.clone()).await {
      Ok((persisted, version)) => {
        self.finish(&data, persisted, version);
        Ok(())
      }
      Err(SaveError::Remote(failure)) if failure.is_connectivity() => {
        info!(key = %self.queue_key, error = %failure, "save hit a connectivity failure, queueing");
        self.enqueue(&data)
      }
      Err(err) => {
        warn!(key = %self.queue_key, error = %err, "save failed");
        let mut entity = lock(&self.entity);
        entity.state = SaveState::Error;
        entity.last_error = Some(err.to_string());
        self.emit(&entity);
        Err(err)
      }
    }
  }

  /// Resolve conflicts if enabled, then persist. Returns what was persisted.
  async fn commit(&self, data: T) -> Result<(T, Option<String>), SaveError> {
    let mut to_save = data;

    if self.options.conflict_detection {
      let base = lock(&self.entity).base_version.clone();
      let remote = self
        .handler
        .remote_snapshot()
        .await
        .map_err(SaveError::Remote)?;
      if let (Some(base), Some(remote)) = (base, remote) {
        if base != remote.version {
          warn!(
            key = %self.queue_key,
            base = %base,
            remote = %remote.version,
            "remote copy changed, resolving conflict"
          );
          to_save = self
            .handler
            .resolve_conflict(Conflict {
              local: to_save,
              remote: remote.data,
            })
            .await
            .map_err(SaveError::Conflict)?;
          lock(&self.entity).base_version = Some(remote.version);
        }
      }
    }

    let version = self
      .handler
      .save(&to_save)
      .await
      .map_err(SaveError::Remote)?;
    Ok((to_save, version))
  }

  fn finish(self: &Arc<Self>, submitted: &T, persisted: T, version: Option<String>) {
    let mut entity = lock(&self.entity);
    // A resolved conflict replaces local data unless it was edited meanwhile
    if entity.current == *submitted {
      entity.current = persisted.clone();
    }
    entity.saved = persisted;
    if version.is_some() {
      entity.base_version = version;
    }
    entity.last_error = None;

    if entity.has_pending_changes() {
      entity.state = SaveState::Dirty;
      self.schedule(&mut entity);
    } else {
      entity.state = SaveState::Saved;
    }
    debug!(key = %self.queue_key, state = entity.state.as_str(), "save completed");
    self.emit(&entity);
  }

  /// Hand `data` to the mutation queue under this entity's key.
  fn enqueue(&self, data: &T) -> Result<(), SaveError> {
    let queued = serde_json::to_value(data)
      .map_err(|e| SaveError::Serialization(e.to_string()))
      .and_then(|payload| {
        let id = self
          .queue
          .pending_for_key(&self.queue_key)
          .map(|item| item.id)
          .unwrap_or_else(|| self.queue_key.clone());
        let options = EnqueueOptions {
          priority: self.options.priority,
          max_attempts: Some(self.options.max_attempts),
          id: Some(id),
        };
        self
          .queue
          .enqueue(&self.queue_key, payload, options)
          .map_err(SaveError::from)
      });

    let mut entity = lock(&self.entity);
    match queued {
      Ok(_) => {
        entity.state = SaveState::OfflineQueued;
        entity.notice = Some(SaveNotice::SavedOffline);
        entity.last_error = None;
        self.emit(&entity);
        Ok(())
      }
      Err(err) => {
        warn!(key = %self.queue_key, error = %err, "could not queue save");
        entity.state = SaveState::Error;
        entity.last_error = Some(err.to_string());
        self.emit(&entity);
        Err(err)
      }
    }
  }

  fn synced(self: &Arc<Self>, persisted: T, version: Option<String>) {
    let queued = self.queue.pending_for_key(&self.queue_key).is_some();
    let mut entity = lock(&self.entity);
    entity.saved = persisted;
    if version.is_some() {
      entity.base_version = version;
    }
    entity.notice = Some(SaveNotice::Synced);
    if !entity.has_pending_changes() {
      entity.state = SaveState::Saved;
      entity.last_error = None;
    } else if !queued && entity.state != SaveState::Saving {
      // Edited since this save was queued
      entity.state = SaveState::Dirty;
      entity.last_error = None;
      self.schedule(&mut entity);
    }
    info!(key = %self.queue_key, "queued save synced");
    self.emit(&entity);
  }

  fn replay_failed(&self, error: &str, exhausted: bool) {
    let mut entity = lock(&self.entity);
    entity.last_error = Some(error.to_string());
    if exhausted {
      entity.state = SaveState::Error;
    }
    self.emit(&entity);
  }

  fn is_saved(&self, payload: &serde_json::Value) -> bool {
    let entity = lock(&self.entity);
    serde_json::to_value(&entity.saved).is_ok_and(|saved| &saved == payload)
  }
}

/// Replays this entity's queued save through its handler.
struct ReplayProcessor<T: Editable> {
  core: Weak<Core<T>>,
  handler: Arc<dyn SaveHandler<T>>,
}

#[async_trait]
impl<T: Editable> Processor for ReplayProcessor<T> {
  async fn process(&self, item: &QueuedMutation) -> Result<(), ProcessError> {
    let data: T = serde_json::from_value(item.payload.clone())
      .map_err(|e| ProcessError::new(format!("queued save does not decode: {}", e)))?;

    match self.handler.save(&data).await {
      Ok(version) => {
        if let Some(core) = self.core.upgrade() {
          core.synced(data, version);
        }
        Ok(())
      }
      Err(failure) => {
        let message = failure.to_string();
        if let Some(core) = self.core.upgrade() {
          core.replay_failed(&message, item.attempts + 1 >= item.max_attempts);
        }
        Err(ProcessError::new(message))
      }
    }
  }

  /// Skip saves the remote store already has.
  fn validate(&self, item: &QueuedMutation) -> bool {
    match self.core.upgrade() {
      Some(core) => !core.is_saved(&item.payload),
      None => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::QueueConfig;
  use crate::save::{RemoteSnapshot, Validation};
  use crate::storage::MemoryStore;
  use serde::Deserialize;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Recipe {
    name: String,
    servings: u32,
  }

  fn recipe(name: &str, servings: u32) -> Recipe {
    Recipe {
      name: name.to_string(),
      servings,
    }
  }

  #[derive(Default)]
  struct FakeHandler {
    saves: Mutex<Vec<Recipe>>,
    failure: Mutex<Option<SaveFailure>>,
    require_name: bool,
    delay: Option<Duration>,
    remote: Mutex<Option<RemoteSnapshot<Recipe>>>,
    next_version: Mutex<Option<String>>,
    resolver_fails: bool,
  }

  impl FakeHandler {
    fn saves(&self) -> Vec<Recipe> {
      self.saves.lock().unwrap().clone()
    }

    fn fail_with(&self, failure: Option<SaveFailure>) {
      *self.failure.lock().unwrap() = failure;
    }
  }

  #[async_trait]
  impl SaveHandler<Recipe> for FakeHandler {
    async fn save(&self, data: &Recipe) -> Result<Option<String>, SaveFailure> {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      let failure = self.failure.lock().unwrap().clone();
      if let Some(failure) = failure {
        return Err(failure);
      }
      self.saves.lock().unwrap().push(data.clone());
      let version = self.next_version.lock().unwrap().clone();
      Ok(version)
    }

    fn validate(&self, data: &Recipe) -> Validation {
      if self.require_name && data.name.is_empty() {
        "Name is required".into()
      } else {
        Validation::Valid
      }
    }

    async fn remote_snapshot(&self) -> Result<Option<RemoteSnapshot<Recipe>>, SaveFailure> {
      let remote = self.remote.lock().unwrap().clone();
      Ok(remote)
    }

    async fn resolve_conflict(&self, conflict: Conflict<Recipe>) -> Result<Recipe, SaveFailure> {
      if self.resolver_fails {
        return Err(SaveFailure::Rejected("cannot merge".into()));
      }
      Ok(Recipe {
        name: conflict.local.name,
        servings: conflict.remote.servings,
      })
    }
  }

  struct Harness {
    queue: MutationQueue,
    connectivity: Connectivity,
    recovery: Arc<MemoryStore>,
    ctx: SaveContext,
  }

  fn harness(online: bool) -> Harness {
    let connectivity = Connectivity::new(online);
    let queue = MutationQueue::open(
      Arc::new(MemoryStore::new()),
      QueueConfig {
        retry_delay_ms: 0,
        ..QueueConfig::default()
      },
      connectivity.clone(),
    )
    .unwrap();
    let recovery = Arc::new(MemoryStore::new());
    let ctx = SaveContext {
      queue: queue.clone(),
      connectivity: connectivity.clone(),
      recovery: recovery.clone(),
    };
    Harness {
      queue,
      connectivity,
      recovery,
      ctx,
    }
  }

  fn mount(h: &Harness, handler: &Arc<FakeHandler>, options: SaveOptions) -> SaveOrchestrator<Recipe> {
    SaveOrchestrator::new(recipe("Soup", 2), handler.clone(), &h.ctx, options).unwrap()
  }

  fn options() -> SaveOptions {
    SaveOptions::new("recipe-1")
  }

  #[tokio::test(start_paused = true)]
  async fn test_unchanged_updates_never_dirty_or_save() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    for _ in 0..3 {
      orchestrator.update_data(recipe("Soup", 2));
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!orchestrator.has_pending_changes());
    assert_eq!(orchestrator.state(), SaveState::Idle);
    assert!(handler.saves().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_reverting_an_edit_cancels_the_save() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    assert_eq!(orchestrator.state(), SaveState::Dirty);
    orchestrator.update_data(recipe("Soup", 2));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(orchestrator.state(), SaveState::Idle);
    assert!(handler.saves().is_empty());
  }

  #[tokio::test]
  async fn test_manual_save_persists_and_cleans() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());
    let mut statuses = orchestrator.subscribe();

    orchestrator.update_data(recipe("Stew", 4));
    assert!(orchestrator.before_unload());
    orchestrator.manual_save().await.unwrap();

    assert_eq!(handler.saves(), vec![recipe("Stew", 4)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);
    assert!(!orchestrator.has_pending_changes());
    assert!(!orchestrator.before_unload());
    assert_eq!(orchestrator.saved_data(), recipe("Stew", 4));

    let dirty = statuses.recv().await.unwrap();
    assert_eq!(dirty.state, SaveState::Dirty);
    assert!(dirty.has_pending_changes);
  }

  #[tokio::test(start_paused = true)]
  async fn test_debounce_sends_only_latest_edit() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("S", 2));
    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.update_data(recipe("St", 2));
    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.update_data(recipe("Stew", 2));
    assert!(handler.saves().is_empty());

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);
  }

  #[tokio::test]
  async fn test_offline_save_is_queued_without_network_call() {
    let h = harness(false);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();

    assert!(handler.saves().is_empty());
    let status = orchestrator.status();
    assert_eq!(status.state, SaveState::OfflineQueued);
    assert_eq!(status.notice, Some(SaveNotice::SavedOffline));
    assert!(status.has_pending_changes);

    let item = h.queue.get_item("recipe-1:save").unwrap();
    assert_eq!(item.key, "recipe-1:save");
    assert_eq!(item.status, MutationStatus::Pending);
    assert_eq!(item.payload, serde_json::json!({"name": "Stew", "servings": 2}));
  }

  #[tokio::test]
  async fn test_queued_save_replays_on_reconnect() {
    let h = harness(false);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();
    h.connectivity.set_online(true);
    h.queue.process_queue().await.unwrap();

    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
    let status = orchestrator.status();
    assert_eq!(status.state, SaveState::Saved);
    assert_eq!(status.notice, Some(SaveNotice::Synced));
    assert!(!status.has_pending_changes);
    assert_eq!(h.queue.get_queue_stats().pending, 0);
  }

  #[tokio::test]
  async fn test_reverting_a_queued_edit_discards_it() {
    let h = harness(false);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();
    assert!(h.queue.pending_for_key("recipe-1:save").is_some());

    orchestrator.update_data(recipe("Soup", 2));
    let status = orchestrator.status();
    assert_eq!(status.state, SaveState::Idle);
    assert!(!status.has_pending_changes);
    assert_eq!(status.notice, None);
    assert!(h.queue.pending_for_key("recipe-1:save").is_none());

    h.connectivity.set_online(true);
    h.queue.process_queue().await.unwrap();

    assert!(handler.saves().is_empty());
    assert_eq!(orchestrator.state(), SaveState::Idle);
    assert!(!orchestrator.has_pending_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_edits_replace_the_queued_save() {
    let h = harness(false);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();
    orchestrator.update_data(recipe("Stew", 3));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let stats = h.queue.get_queue_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.items[0].payload, serde_json::json!({"name": "Stew", "servings": 3}));

    h.connectivity.set_online(true);
    h.queue.process_queue().await.unwrap();

    assert_eq!(handler.saves(), vec![recipe("Stew", 3)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);
  }

  #[tokio::test(start_paused = true)]
  async fn test_edit_racing_a_replay_is_saved_afterwards() {
    let h = harness(false);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();
    h.connectivity.set_online(true);

    orchestrator.update_data(recipe("Stew", 3));
    h.queue.process_queue().await.unwrap();

    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
    let status = orchestrator.status();
    assert_eq!(status.state, SaveState::Dirty);
    assert!(status.has_pending_changes);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.saves(), vec![recipe("Stew", 2), recipe("Stew", 3)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);
    assert!(!orchestrator.has_pending_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_debounced_rejection_only_shows_in_state() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    handler.fail_with(Some(SaveFailure::Rejected("500 internal error".into())));
    let orchestrator = mount(&h, &handler, options());
    let mut statuses = orchestrator.subscribe();

    orchestrator.update_data(recipe("Stew", 2));
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = orchestrator.status();
    assert_eq!(status.state, SaveState::Error);
    assert!(status.has_pending_changes);
    assert!(status.last_error.unwrap().contains("500"));
    assert!(handler.saves().is_empty());
    assert!(h.queue.get_item("recipe-1:save").is_none());

    let mut seen = Vec::new();
    while let Ok(status) = statuses.try_recv() {
      seen.push(status.state);
    }
    assert_eq!(seen.last(), Some(&SaveState::Error));
  }

  #[tokio::test]
  async fn test_validation_blocks_save() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler {
      require_name: true,
      ..FakeHandler::default()
    });
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("", 2));
    let err = orchestrator.manual_save().await.unwrap_err();

    assert_eq!(err, SaveError::Validation("Name is required".into()));
    assert_eq!(err.to_string(), "Name is required");
    assert!(handler.saves().is_empty());
    assert_eq!(orchestrator.state(), SaveState::Error);
    assert!(orchestrator.has_pending_changes());
  }

  #[tokio::test]
  async fn test_connectivity_failure_is_queued() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    handler.fail_with(Some(SaveFailure::from_message("Failed to fetch")));
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();

    assert_eq!(orchestrator.state(), SaveState::OfflineQueued);
    assert!(h.queue.get_item("recipe-1:save").is_some());
  }

  #[tokio::test]
  async fn test_remote_rejection_keeps_pending_changes() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    handler.fail_with(Some(SaveFailure::Rejected("422 invalid servings".into())));
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 0));
    let err = orchestrator.manual_save().await.unwrap_err();

    assert!(matches!(err, SaveError::Remote(SaveFailure::Rejected(_))));
    let status = orchestrator.status();
    assert_eq!(status.state, SaveState::Error);
    assert!(status.has_pending_changes);
    assert!(status.last_error.unwrap().contains("422"));
    assert!(orchestrator.before_unload());
    assert!(h.queue.get_item("recipe-1:save").is_none());
  }

  #[tokio::test]
  async fn test_retry_failed_saves_reports_exhaustion() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    handler.fail_with(Some(SaveFailure::Network("connection reset".into())));
    let orchestrator = mount(&h, &handler, options().with_max_attempts(1));

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();
    h.queue.process_queue().await.unwrap();
    assert_eq!(orchestrator.state(), SaveState::Error);

    let (id, reason) = match orchestrator.retry_failed_saves().await {
      Err(SaveError::Queue(QueueError::Exhausted { id, reason })) => (id, reason),
      other => panic!("expected exhaustion, got {:?}", other),
    };
    assert!(id.starts_with("recipe-1:save-"));
    assert_eq!(reason, "network error: connection reset");

    // The first exhausted attempt keeps its record
    let first = h.queue.get_item("recipe-1:save").unwrap();
    assert_eq!(first.status, MutationStatus::Failed);
    assert_eq!(first.attempts, 1);

    handler.fail_with(None);
    orchestrator.retry_failed_saves().await.unwrap();
    assert_eq!(orchestrator.state(), SaveState::Saved);
    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
    assert_eq!(h.queue.get_queue_stats().failed, 2);
  }

  #[tokio::test]
  async fn test_conflict_is_resolved_before_saving() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler {
      remote: Mutex::new(Some(RemoteSnapshot {
        version: "v2".into(),
        data: recipe("Soup", 6),
      })),
      next_version: Mutex::new(Some("v3".into())),
      ..FakeHandler::default()
    });
    let orchestrator = mount(&h, &handler, options().with_conflict_detection());
    orchestrator.set_base_version(Some("v1".into()));

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();

    assert_eq!(handler.saves(), vec![recipe("Stew", 6)]);
    assert_eq!(orchestrator.data(), recipe("Stew", 6));
    assert_eq!(orchestrator.base_version().as_deref(), Some("v3"));
    assert_eq!(orchestrator.state(), SaveState::Saved);
  }

  #[tokio::test]
  async fn test_matching_version_skips_resolver() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler {
      remote: Mutex::new(Some(RemoteSnapshot {
        version: "v1".into(),
        data: recipe("Soup", 6),
      })),
      resolver_fails: true,
      ..FakeHandler::default()
    });
    let orchestrator = mount(&h, &handler, options().with_conflict_detection());
    orchestrator.set_base_version(Some("v1".into()));

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();

    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
  }

  #[tokio::test]
  async fn test_resolver_failure_is_an_error() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler {
      remote: Mutex::new(Some(RemoteSnapshot {
        version: "v2".into(),
        data: recipe("Soup", 6),
      })),
      resolver_fails: true,
      ..FakeHandler::default()
    });
    let orchestrator = mount(&h, &handler, options().with_conflict_detection());
    orchestrator.set_base_version(Some("v1".into()));

    orchestrator.update_data(recipe("Stew", 2));
    let err = orchestrator.manual_save().await.unwrap_err();

    assert!(matches!(err, SaveError::Conflict(_)));
    assert!(handler.saves().is_empty());
    assert_eq!(orchestrator.state(), SaveState::Error);
    assert!(orchestrator.has_pending_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_hidden_page_forces_save() {
    let h = harness(true);
    let page = PageEvents::new();
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());
    orchestrator.attach(&page);

    orchestrator.update_data(recipe("Stew", 2));
    page.emit(PageEvent::Hidden);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);

    // The forced save replaced the debounced one
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.saves().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hidden_page_flushes_after_an_error() {
    let h = harness(true);
    let page = PageEvents::new();
    let handler = Arc::new(FakeHandler::default());
    handler.fail_with(Some(SaveFailure::Rejected("503 try later".into())));
    let orchestrator = mount(&h, &handler, options());
    orchestrator.attach(&page);

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap_err();
    assert_eq!(orchestrator.state(), SaveState::Error);

    handler.fail_with(None);
    page.emit(PageEvent::Hidden);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(handler.saves(), vec![recipe("Stew", 2)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unload_publishes_status_only_with_pending_changes() {
    let h = harness(true);
    let page = PageEvents::new();
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());
    orchestrator.attach(&page);
    let mut statuses = orchestrator.subscribe();

    page.emit(PageEvent::BeforeUnload);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(statuses.try_recv().is_err());

    orchestrator.update_data(recipe("Stew", 2));
    assert_eq!(statuses.try_recv().unwrap().state, SaveState::Dirty);

    page.emit(PageEvent::BeforeUnload);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = statuses.try_recv().unwrap();
    assert!(status.has_pending_changes);
    assert!(orchestrator.before_unload());
  }

  #[tokio::test(start_paused = true)]
  async fn test_detach_cancels_pending_debounce() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.detach();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(handler.saves().is_empty());
    assert!(orchestrator.has_pending_changes());
  }

  #[tokio::test(start_paused = true)]
  async fn test_edit_during_save_reschedules() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler {
      delay: Some(Duration::from_secs(1)),
      ..FakeHandler::default()
    });
    let orchestrator = Arc::new(mount(&h, &handler, options()));

    orchestrator.update_data(recipe("Stew", 2));
    let saving = {
      let orchestrator = Arc::clone(&orchestrator);
      tokio::spawn(async move { orchestrator.manual_save().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.state(), SaveState::Saving);

    orchestrator.update_data(recipe("Stew", 3));
    saving.await.unwrap().unwrap();
    assert_eq!(orchestrator.state(), SaveState::Dirty);
    assert!(orchestrator.has_pending_changes());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.saves(), vec![recipe("Stew", 2), recipe("Stew", 3)]);
    assert_eq!(orchestrator.state(), SaveState::Saved);
  }

  #[tokio::test]
  async fn test_recovery_backup_survives_remount() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());
    assert_eq!(orchestrator.get_recovery_data().unwrap(), None);

    orchestrator.update_data(recipe("Stew", 2));
    drop(orchestrator);

    let remounted = mount(&h, &handler, options());
    assert_eq!(remounted.get_recovery_data().unwrap(), Some(recipe("Stew", 2)));
    remounted.clear_recovery_data().unwrap();
    assert_eq!(remounted.get_recovery_data().unwrap(), None);
  }

  #[tokio::test]
  async fn test_failed_backup_is_counted() {
    let h = harness(true);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());
    h.recovery
      .fail_writes(Some(StorageError::Transient("quota exceeded".into())));

    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.update_data(recipe("Stew", 3));
    assert_eq!(orchestrator.status().recovery_attempts, 2);

    h.recovery.fail_writes(None);
    orchestrator.update_data(recipe("Stew", 4));
    assert_eq!(orchestrator.status().recovery_attempts, 0);
  }

  #[tokio::test]
  async fn test_remount_picks_up_queued_save() {
    let h = harness(false);
    let handler = Arc::new(FakeHandler::default());
    let orchestrator = mount(&h, &handler, options());
    orchestrator.update_data(recipe("Stew", 2));
    orchestrator.manual_save().await.unwrap();
    drop(orchestrator);

    let remounted = mount(&h, &handler, options());

    assert_eq!(remounted.state(), SaveState::OfflineQueued);
    assert_eq!(remounted.data(), recipe("Stew", 2));
    assert!(remounted.has_pending_changes());
  }
}
