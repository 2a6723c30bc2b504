//! SQLite implementation of the key-value store.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::KeyValueStore;
use crate::error::{Error, Result};

/// SQLite-based key-value storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path).map_err(|e| Error::StorageRead {
      key: path.display().to_string(),
      message: e.to_string(),
    })?;
    debug!(path = %path.display(), "opened key-value store");

    Self::with_connection(conn)
  }

  /// Open a database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory().map_err(|e| Error::StorageRead {
      key: ":memory:".to_string(),
      message: e.to_string(),
    })?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(SCHEMA).map_err(|e| Error::StorageWrite {
      key: "schema".to_string(),
      message: e.to_string(),
    })?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self, key: &str) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| Error::StorageRead {
      key: key.to_string(),
      message: format!("lock poisoned: {}", e),
    })
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock(key)?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| Error::StorageRead {
        key: key.to_string(),
        message: e.to_string(),
      })
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock(key)?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| Error::StorageWrite {
        key: key.to_string(),
        message: e.to_string(),
      })?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock(key)?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| Error::StorageWrite {
        key: key.to_string(),
        message: e.to_string(),
      })?;

    Ok(())
  }
}
