//! Durable storage for queue state, recovery snapshots and cache buckets.
//!
//! Every operation returns a [`StorageResult`] so callers can tell a retryable
//! hiccup ([`StorageError::Transient`]) from data that will never decode
//! ([`StorageError::Corrupt`]).

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::cache::Response;

/// Failure of a durable storage operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
  /// The backend is busy or locked; the same call may succeed later.
  #[error("storage temporarily unavailable: {0}")]
  Transient(String),
  /// Stored bytes cannot be decoded. Retrying will not help.
  #[error("stored data is corrupt: {0}")]
  Corrupt(String),
  /// Any other backend failure.
  #[error("storage backend failure: {0}")]
  Backend(String),
}

impl StorageError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Transient(_))
  }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Origin-scoped key/value store that survives restarts.
pub trait DurableStore: Send + Sync {
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

  fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Named response buckets used by the cache orchestrator.
///
/// Buckets only grow or overwrite entries; whole buckets are dropped with
/// [`BucketStore::delete_bucket`] when a cache generation is retired.
pub trait BucketStore: Send + Sync {
  /// Names of all buckets holding at least one entry.
  fn bucket_names(&self) -> StorageResult<Vec<String>>;

  fn lookup(&self, bucket: &str, key: &str) -> StorageResult<Option<Response>>;

  fn put(&self, bucket: &str, key: &str, response: &Response) -> StorageResult<()>;

  /// Returns true when the bucket existed.
  fn delete_bucket(&self, bucket: &str) -> StorageResult<bool>;

  fn bucket_len(&self, bucket: &str) -> StorageResult<usize>;
}

/// Read and decode a JSON value. Undecodable bytes are reported as corrupt.
pub fn load_json<T: DeserializeOwned>(
  store: &dyn DurableStore,
  key: &str,
) -> StorageResult<Option<T>> {
  match store.get(key)? {
    Some(bytes) => serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|e| StorageError::Corrupt(format!("{}: {}", key, e))),
    None => Ok(None),
  }
}

/// Encode a value as JSON and write it.
pub fn store_json<T: Serialize + ?Sized>(
  store: &dyn DurableStore,
  key: &str,
  value: &T,
) -> StorageResult<()> {
  let bytes = serde_json::to_vec(value)
    .map_err(|e| StorageError::Backend(format!("failed to serialize {}: {}", key, e)))?;
  store.set(key, &bytes)
}
