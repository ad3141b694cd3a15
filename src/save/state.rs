//! Save lifecycle state exposed to the UI.

use serde::Serialize;

/// Where an editable entity is in its save lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveState {
  #[default]
  Idle,
  Dirty,
  Saving,
  Saved,
  /// Handed to the mutation queue, waiting for connectivity
  OfflineQueued,
  Error,
}

impl SaveState {
  pub fn as_str(&self) -> &'static str {
    match self {
      SaveState::Idle => "idle",
      SaveState::Dirty => "dirty",
      SaveState::Saving => "saving",
      SaveState::Saved => "saved",
      SaveState::OfflineQueued => "offline-queued",
      SaveState::Error => "error",
    }
  }
}

/// Informational notices; not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaveNotice {
  /// Saved locally, will sync when back online
  SavedOffline,
  /// A queued save reached the remote store
  Synced,
}

/// Snapshot broadcast on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatus {
  pub state: SaveState,
  pub has_pending_changes: bool,
  pub last_error: Option<String>,
  pub notice: Option<SaveNotice>,
  /// Failed recovery backup writes since the last successful one
  pub recovery_attempts: u32,
}
