//! Bucket store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::types::{RequestKey, Snapshot};

/// Recoverable storage failures. Callers on the request path log these and
/// carry on as if the bucket were empty.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
  QuotaExceeded { needed: u64, quota: u64 },

  #[error("storage backend failure: {0}")]
  Backend(String),

  #[error("corrupt cache entry: {0}")]
  Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

/// An opened bucket. Cheap to clone; holds no snapshot data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHandle {
  name: String,
}

impl BucketHandle {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Trait for bucket storage backends.
///
/// Every write is a whole-snapshot overwrite keyed by request identity, so
/// implementations only need to make single operations atomic.
pub trait BucketStore: Send + Sync + 'static {
  /// Open a bucket, creating it if it does not exist.
  fn open(&self, name: &str) -> Result<BucketHandle, StorageError>;

  /// Store a snapshot, replacing any prior snapshot for the same key.
  fn put(
    &self,
    bucket: &BucketHandle,
    key: &RequestKey,
    snapshot: &Snapshot,
  ) -> Result<(), StorageError>;

  /// Look up the snapshot stored for a key.
  fn lookup(&self, bucket: &BucketHandle, key: &RequestKey)
    -> Result<Option<Snapshot>, StorageError>;

  /// Remove one entry. Returns whether anything was removed.
  fn delete(&self, bucket: &BucketHandle, key: &RequestKey) -> Result<bool, StorageError>;

  /// Names of every bucket currently present.
  fn bucket_names(&self) -> Result<BTreeSet<String>, StorageError>;

  /// Drop a bucket and all of its entries. Returns whether it existed.
  fn delete_bucket(&self, name: &str) -> Result<bool, StorageError>;
}

/// SQLite-based bucket storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Upper bound on total stored body bytes
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>, quota_bytes: Option<u64>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open bucket store at {}: {}", path.display(), e))?;

    Self::with_connection(conn, quota_bytes)
  }

  /// A throwaway store that lives only as long as the value.
  pub fn in_memory(quota_bytes: Option<u64>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory bucket store: {}", e))?;
    Self::with_connection(conn, quota_bytes)
  }

  fn with_connection(conn: Connection, quota_bytes: Option<u64>) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("edgecache").join("buckets.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock();
    conn
      .execute_batch(BUCKET_SCHEMA)
      .map_err(|e| eyre!("Failed to run bucket migrations: {}", e))?;
    Ok(())
  }

  // A panic mid-statement leaves nothing half-written that SQLite would
  // not already have rolled back, so a poisoned lock is still usable.
  fn lock(&self) -> MutexGuard<'_, Connection> {
    self
      .conn
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }
}

/// Schema for bucket tables.
const BUCKET_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (bucket, key_hash),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);
"#;

impl BucketStore for SqliteStorage {
  fn open(&self, name: &str) -> Result<BucketHandle, StorageError> {
    let conn = self.lock();
    conn.execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![name],
    )?;
    Ok(BucketHandle::new(name))
  }

  fn put(
    &self,
    bucket: &BucketHandle,
    key: &RequestKey,
    snapshot: &Snapshot,
  ) -> Result<(), StorageError> {
    let conn = self.lock();
    let key_hash = key.hash();

    if let Some(quota) = self.quota_bytes {
      // The entry being replaced does not count against the quota
      let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM entries
         WHERE NOT (bucket = ? AND key_hash = ?)",
        params![bucket.name(), key_hash],
        |row| row.get(0),
      )?;
      let needed = used.max(0) as u64 + snapshot.body.len() as u64;
      if needed > quota {
        return Err(StorageError::QuotaExceeded { needed, quota });
      }
    }

    let headers = serde_json::to_string(&snapshot.headers)
      .map_err(|e| StorageError::Corrupt(format!("headers for {}: {}", key, e)))?;

    // A handle can outlive its bucket being dropped; writes recreate it
    conn.execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket.name()],
    )?;
    conn.execute(
      "INSERT OR REPLACE INTO entries (bucket, key_hash, request_key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        bucket.name(),
        key_hash,
        key.as_str(),
        snapshot.status,
        headers,
        snapshot.body,
        snapshot.stored_at.to_rfc3339(),
      ],
    )?;

    Ok(())
  }

  fn lookup(
    &self,
    bucket: &BucketHandle,
    key: &RequestKey,
  ) -> Result<Option<Snapshot>, StorageError> {
    let conn = self.lock();

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE bucket = ? AND key_hash = ?",
        params![bucket.name(), key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| StorageError::Corrupt(format!("headers for {}: {}", key, e)))?;
        Ok(Some(Snapshot {
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, bucket: &BucketHandle, key: &RequestKey) -> Result<bool, StorageError> {
    let conn = self.lock();
    let removed = conn.execute(
      "DELETE FROM entries WHERE bucket = ? AND key_hash = ?",
      params![bucket.name(), key.hash()],
    )?;
    Ok(removed > 0)
  }

  fn bucket_names(&self) -> Result<BTreeSet<String>, StorageError> {
    let conn = self.lock();
    let mut stmt = conn.prepare("SELECT name FROM buckets")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(names)
  }

  fn delete_bucket(&self, name: &str) -> Result<bool, StorageError> {
    let conn = self.lock();
    let removed = conn.execute("DELETE FROM buckets WHERE name = ?", params![name])?;
    Ok(removed > 0)
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::Corrupt(format!("timestamp '{}': {}", s, e)))
}
