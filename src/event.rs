//! Connectivity and page lifecycle signals shared by the resilience components.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Online/offline flag with change notification.
///
/// Cheap to clone; every clone observes the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a connectivity change. Subscribers are only woken on actual changes.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "connectivity changed");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Page lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
  /// Page became hidden (tab switched, app backgrounded)
  Hidden,
  /// The page is about to be unloaded
  BeforeUnload,
}

/// Broadcasts page lifecycle events to every mounted editor.
#[derive(Debug, Clone)]
pub struct PageEvents {
  tx: broadcast::Sender<PageEvent>,
}

impl PageEvents {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(16);
    Self { tx }
  }

  pub fn emit(&self, event: PageEvent) {
    // No listeners means nothing is mounted
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
    self.tx.subscribe()
  }
}

impl Default for PageEvents {
  fn default() -> Self {
    Self::new()
  }
}
