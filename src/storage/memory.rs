//! In-process storage used by tests and hosts without a disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{BucketStore, DurableStore, StorageError, StorageResult};
use crate::cache::Response;
use crate::lock;

/// Storage kept entirely in memory. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
  records: Mutex<HashMap<String, Vec<u8>>>,
  buckets: Mutex<BTreeMap<String, HashMap<String, Response>>>,
  /// Fault injection: when set, every write fails with this error.
  write_failure: Mutex<Option<StorageError>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent write fail with `error` (or succeed again with `None`).
  pub fn fail_writes(&self, error: Option<StorageError>) {
    *lock(&self.write_failure) = error;
  }

  fn check_writable(&self) -> StorageResult<()> {
    match lock(&self.write_failure).clone() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    Ok(lock(&self.records).get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    self.check_writable()?;
    lock(&self.records).insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<()> {
    self.check_writable()?;
    lock(&self.records).remove(key);
    Ok(())
  }
}

impl BucketStore for MemoryStore {
  fn bucket_names(&self) -> StorageResult<Vec<String>> {
    Ok(lock(&self.buckets).keys().cloned().collect())
  }

  fn lookup(&self, bucket: &str, key: &str) -> StorageResult<Option<Response>> {
    Ok(
      lock(&self.buckets)
        .get(bucket)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, bucket: &str, key: &str, response: &Response) -> StorageResult<()> {
    self.check_writable()?;
    lock(&self.buckets)
      .entry(bucket.to_string())
      .or_default()
      .insert(key.to_string(), response.clone());
    Ok(())
  }

  fn delete_bucket(&self, bucket: &str) -> StorageResult<bool> {
    self.check_writable()?;
    Ok(lock(&self.buckets).remove(bucket).is_some())
  }

  fn bucket_len(&self, bucket: &str) -> StorageResult<usize> {
    Ok(lock(&self.buckets).get(bucket).map_or(0, HashMap::len))
  }
}
