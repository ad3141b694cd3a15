//! Processor contract for queued mutations.

use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

use super::item::QueuedMutation;

/// Failure reported by a processor; recorded as the item's `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProcessError(pub String);

impl ProcessError {
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

impl From<String> for ProcessError {
  fn from(message: String) -> Self {
    Self(message)
  }
}

impl From<&str> for ProcessError {
  fn from(message: &str) -> Self {
    Self(message.to_string())
  }
}

/// Replays queued mutations whose key matches the registered pattern.
#[async_trait]
pub trait Processor: Send + Sync {
  async fn process(&self, item: &QueuedMutation) -> Result<(), ProcessError>;

  /// Whether the item is still relevant. Irrelevant items are dropped silently.
  fn validate(&self, _item: &QueuedMutation) -> bool {
    true
  }

  /// Normalize the item before processing (e.g. refresh timestamps).
  fn transform(&self, item: QueuedMutation) -> QueuedMutation {
    item
  }
}

/// [`Processor`] built from an async closure.
pub struct FnProcessor<F>(F);

/// Wrap an async closure as a processor.
///
/// ```ignore
/// queue.register_processor("pantry:*", processor_fn(|item| async move {
///     api.save_pantry(item.payload).await.map_err(|e| ProcessError::new(e.to_string()))
/// }))?;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
  F: Fn(QueuedMutation) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), ProcessError>> + Send,
{
  FnProcessor(f)
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
  F: Fn(QueuedMutation) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), ProcessError>> + Send,
{
  async fn process(&self, item: &QueuedMutation) -> Result<(), ProcessError> {
    (self.0)(item.clone()).await
  }
}
