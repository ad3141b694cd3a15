//! Host-supplied persistence contract for one editable entity type.

use async_trait::async_trait;
use thiserror::Error;

/// Outcome of validating local data before a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
  Valid,
  /// Rejected without a message
  Invalid,
  /// Rejected with a user-facing message
  Rejected(String),
}

impl Validation {
  /// The blocking message, if any.
  pub fn message(&self) -> Option<String> {
    match self {
      Validation::Valid => None,
      Validation::Invalid => Some("Validation failed".to_string()),
      Validation::Rejected(message) => Some(message.clone()),
    }
  }
}

impl From<bool> for Validation {
  fn from(valid: bool) -> Self {
    if valid {
      Validation::Valid
    } else {
      Validation::Invalid
    }
  }
}

impl From<String> for Validation {
  fn from(message: String) -> Self {
    Validation::Rejected(message)
  }
}

impl From<&str> for Validation {
  fn from(message: &str) -> Self {
    Validation::Rejected(message.to_string())
  }
}

/// Why a remote save did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveFailure {
  /// The remote store could not be reached; worth queueing
  #[error("network error: {0}")]
  Network(String),
  /// The remote store answered and refused
  #[error("{0}")]
  Rejected(String),
}

const CONNECTIVITY_HINTS: &[&str] = &[
  "network",
  "fetch",
  "offline",
  "timeout",
  "timed out",
  "connection",
  "unreachable",
];

impl SaveFailure {
  pub fn is_connectivity(&self) -> bool {
    matches!(self, SaveFailure::Network(_))
  }

  /// Classify a bare error message for hosts that only have text.
  pub fn from_message(message: impl Into<String>) -> Self {
    let message = message.into();
    let lower = message.to_lowercase();
    if CONNECTIVITY_HINTS.iter().any(|hint| lower.contains(hint)) {
      SaveFailure::Network(message)
    } else {
      SaveFailure::Rejected(message)
    }
  }
}

/// Server-side copy of the entity with its version marker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot<T> {
  pub version: String,
  pub data: T,
}

/// Local and remote copies that diverged, handed to the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict<T> {
  pub local: T,
  pub remote: T,
}

/// Persists one entity type remotely.
///
/// Only `save` is required. `remote_snapshot` and `resolve_conflict` are used
/// when conflict detection is enabled.
#[async_trait]
pub trait SaveHandler<T: Send + Sync + 'static>: Send + Sync {
  /// Persist `data`, returning the new remote version marker if known.
  async fn save(&self, data: &T) -> Result<Option<String>, SaveFailure>;

  fn validate(&self, _data: &T) -> Validation {
    Validation::Valid
  }

  async fn remote_snapshot(&self) -> Result<Option<RemoteSnapshot<T>>, SaveFailure> {
    Ok(None)
  }

  /// Decide what to persist when the remote copy changed underneath us.
  async fn resolve_conflict(&self, _conflict: Conflict<T>) -> Result<T, SaveFailure> {
    Err(SaveFailure::Rejected(
      "remote copy changed and no conflict resolver is configured".to_string(),
    ))
  }
}
