//! Generic HTTP replay of queued mutations.
//!
//! Used by hosts (and the operator CLI) that have no entity-specific
//! processor: each payload is POSTed as JSON to the origin path derived from
//! the item key, `recipe-42:save` becoming `/recipe-42/save`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{Fetch, Method, Request};
use crate::queue::{ProcessError, Processor, QueuedMutation};

pub struct RemoteReplay {
  fetcher: Arc<dyn Fetch>,
  origin: Url,
}

impl RemoteReplay {
  pub fn new(fetcher: Arc<dyn Fetch>, origin: Url) -> Self {
    Self { fetcher, origin }
  }

  /// Endpoint for a queue key.
  pub fn endpoint(&self, key: &str) -> Result<Url, url::ParseError> {
    self.origin.join(&format!("/{}", key.replace(':', "/")))
  }
}

#[async_trait]
impl Processor for RemoteReplay {
  async fn process(&self, item: &QueuedMutation) -> Result<(), ProcessError> {
    let url = self
      .endpoint(&item.key)
      .map_err(|e| ProcessError::new(format!("bad endpoint for {}: {}", item.key, e)))?;
    let body = serde_json::to_vec(&item.payload)
      .map_err(|e| ProcessError::new(format!("payload does not serialize: {}", e)))?;

    debug!(id = %item.id, %url, "replaying mutation");
    let request = Request::new(Method::Post, url).with_json_body(body);
    let response = self
      .fetcher
      .fetch(&request)
      .await
      .map_err(|e| ProcessError::new(e.to_string()))?;

    if response.is_success() {
      Ok(())
    } else {
      Err(ProcessError::new(format!(
        "remote rejected mutation with status {}",
        response.status
      )))
    }
  }
}
