//! SQLite-backed durable storage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use sha2::{Digest, Sha256};

use super::{BucketStore, DurableStore, StorageError, StorageResult};
use crate::cache::Response;

/// Durable store and response cache in a single SQLite database.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Backend(format!("failed to create store directory: {}", e))
      })?;
    }

    let conn = Connection::open(path)?;
    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> StorageResult<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("mealsync").join("store.db"))
  }

  fn from_connection(conn: Connection) -> StorageResult<Self> {
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Backend(format!("lock poisoned: {}", e)))
  }
}

/// Schema for the store tables.
const STORE_SCHEMA: &str = r#"
-- Durable key/value records (queue state, recovery snapshots)
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, partitioned by bucket
CREATE TABLE IF NOT EXISTS cache_entries (
    bucket TEXT NOT NULL,
    entry_hash TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, entry_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_bucket ON cache_entries(bucket);
"#;

impl From<rusqlite::Error> for StorageError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Self::Transient(err.to_string()),
        ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => Self::Corrupt(err.to_string()),
        _ => Self::Backend(err.to_string()),
      },
      _ => Self::Backend(err.to_string()),
    }
  }
}

/// SHA256 of the entry key, for stable fixed-length primary keys.
fn entry_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

impl DurableStore for SqliteStore {
  fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> StorageResult<()> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }
}

impl BucketStore for SqliteStore {
  fn bucket_names(&self) -> StorageResult<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT DISTINCT bucket FROM cache_entries ORDER BY bucket")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn lookup(&self, bucket: &str, key: &str) -> StorageResult<Option<Response>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE bucket = ? AND entry_hash = ?",
        params![bucket, entry_hash(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| StorageError::Corrupt(format!("headers for {}: {}", key, e)))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, key: &str, response: &Response) -> StorageResult<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| StorageError::Backend(format!("failed to serialize headers: {}", e)))?;
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (bucket, entry_hash, entry_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![bucket, entry_hash(key), key, response.status, headers, response.body],
    )?;
    Ok(())
  }

  fn delete_bucket(&self, bucket: &str) -> StorageResult<bool> {
    let conn = self.conn()?;
    let deleted = conn.execute("DELETE FROM cache_entries WHERE bucket = ?", params![bucket])?;
    Ok(deleted > 0)
  }

  fn bucket_len(&self, bucket: &str) -> StorageResult<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE bucket = ?",
      params![bucket],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set("mutation-queue", b"[]").unwrap();
      store
        .put("mealsync-static-v1", "https://app.test/app.js", &Response::new(200, b"js".to_vec()))
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get("mutation-queue").unwrap(), Some(b"[]".to_vec()));
    let cached = store
      .lookup("mealsync-static-v1", "https://app.test/app.js")
      .unwrap()
      .unwrap();
    assert_eq!(cached.body, b"js");
  }

  #[test]
  fn test_put_overwrites_and_delete_drops_whole_bucket() {
    let store = SqliteStore::open_in_memory().unwrap();
    let key = "https://app.test/api/plans";
    store
      .put("api-v1", key, &Response::new(200, b"old".to_vec()).with_header("Content-Type", "application/json"))
      .unwrap();
    store.put("api-v1", key, &Response::new(200, b"new".to_vec())).unwrap();
    store.put("api-v0", key, &Response::new(200, b"stale".to_vec())).unwrap();

    assert_eq!(store.bucket_len("api-v1").unwrap(), 1);
    assert_eq!(store.lookup("api-v1", key).unwrap().unwrap().body, b"new");
    assert_eq!(store.bucket_names().unwrap(), vec!["api-v0", "api-v1"]);

    assert!(store.delete_bucket("api-v0").unwrap());
    assert_eq!(store.bucket_names().unwrap(), vec!["api-v1"]);
    assert_eq!(store.lookup("api-v0", key).unwrap(), None);
  }

  #[test]
  fn test_remove_and_missing_keys() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.get("recovery:plan").unwrap(), None);
    store.set("recovery:plan", b"{}").unwrap();
    store.remove("recovery:plan").unwrap();
    assert_eq!(store.get("recovery:plan").unwrap(), None);
  }
}
