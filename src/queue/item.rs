//! Queued mutation records and queue statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl MutationStatus {
  /// Pending or processing items are never evicted or collected.
  pub fn is_active(&self) -> bool {
    matches!(self, MutationStatus::Pending | MutationStatus::Processing)
  }

  pub fn is_terminal(&self) -> bool {
    !self.is_active()
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      MutationStatus::Pending => "pending",
      MutationStatus::Processing => "processing",
      MutationStatus::Completed => "completed",
      MutationStatus::Failed => "failed",
    }
  }
}

/// A write waiting to reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
  pub id: String,
  /// Routing key used to pick a processor
  pub key: String,
  /// Processor-defined payload
  pub payload: serde_json::Value,
  pub status: MutationStatus,
  pub attempts: u32,
  pub max_attempts: u32,
  pub created_at: DateTime<Utc>,
  pub last_attempt: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
  pub priority: i32,
  /// Earliest time the next attempt may run (set after a failed attempt)
  #[serde(default)]
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedMutation {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }

  /// When the item last changed hands: the last attempt, else creation.
  pub fn last_touched(&self) -> DateTime<Utc> {
    self.last_attempt.unwrap_or(self.created_at)
  }
}

/// Options for [`super::MutationQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
  /// Higher runs first
  pub priority: i32,
  /// Defaults to the queue's configured limit
  pub max_attempts: Option<u32>,
  /// Caller-chosen id; re-enqueueing the same id replaces the waiting item
  pub id: Option<String>,
}

/// Snapshot of queue contents.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
  pub total: usize,
  pub pending: usize,
  pub processing: usize,
  pub completed: usize,
  pub failed: usize,
  pub oldest_pending: Option<DateTime<Utc>>,
  /// Items in processing order
  pub items: Vec<QueuedMutation>,
}

impl QueueStats {
  pub(crate) fn from_items(items: &[QueuedMutation]) -> Self {
    let mut stats = QueueStats {
      total: items.len(),
      items: items.to_vec(),
      ..QueueStats::default()
    };
    for item in items {
      match item.status {
        MutationStatus::Pending => {
          stats.pending += 1;
          stats.oldest_pending = Some(
            stats
              .oldest_pending
              .map_or(item.created_at, |oldest| oldest.min(item.created_at)),
          );
        }
        MutationStatus::Processing => stats.processing += 1,
        MutationStatus::Completed => stats.completed += 1,
        MutationStatus::Failed => stats.failed += 1,
      }
    }
    stats
  }

  pub fn contains(&self, id: &str) -> bool {
    self.items.iter().any(|item| item.id == id)
  }
}
