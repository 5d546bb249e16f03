//! Key-value storage backends for the persistent cache.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Trait for cache storage backends.
///
/// Values are opaque strings (serialized JSON); the backend never looks
/// inside them.
pub trait KeyValueStorage: Send + Sync + 'static {
  /// Read the value stored under `key`.
  fn get_raw(&self, key: &str) -> Result<Option<String>>;

  /// Replace the value stored under `key`. A concurrent reader sees either the
  /// old or the new value, never a mix.
  fn set_raw(&self, key: &str, value: &str) -> Result<()>;

  /// Remove the given keys. Missing keys are ignored.
  fn remove(&self, keys: &[String]) -> Result<()>;

  /// All stored keys starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

  /// Remove every key starting with `prefix`, returning how many matched.
  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    let keys = self.keys_with_prefix(prefix)?;
    self.remove(&keys)?;
    Ok(keys.len())
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl KeyValueStorage for NoopStorage {
  fn get_raw(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set_raw(&self, _key: &str, _value: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _keys: &[String]) -> Result<()> {
    Ok(())
  }

  fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    conn
      .execute_batch("PRAGMA journal_mode = WAL;")
      .map_err(|e| eyre!("Failed to configure cache database: {}", e))?;

    Self::from_connection(conn)
  }

  /// Create a new SQLite storage at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::default_data_dir()?.join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache key, value is serialized JSON
CREATE TABLE IF NOT EXISTS kv_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStorage for SqliteStorage {
  fn get_raw(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT value FROM kv_cache WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache key {}: {}", key, e))
  }

  fn set_raw(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_cache (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write cache key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
      return Ok(());
    }

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    for key in keys {
      tx.execute("DELETE FROM kv_cache WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to remove cache key {}: {}", key, e))?;
    }
    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache removal: {}", e))?;

    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv_cache WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_set_overwrites_value() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    storage.set_raw("accounts", "[1]").unwrap();
    storage.set_raw("accounts", "[1,2]").unwrap();

    assert_eq!(storage.get_raw("accounts").unwrap().as_deref(), Some("[1,2]"));
    assert_eq!(storage.get_raw("missing").unwrap(), None);
  }

  #[test]
  fn test_prefix_listing_treats_wildcards_literally() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.set_raw("@sisa:data:a", "1").unwrap();
    storage.set_raw("@sisa:data:b", "2").unwrap();
    storage.set_raw("@sisa:file:1", "3").unwrap();
    storage.set_raw("@sisa_data_x", "4").unwrap();

    let keys = storage.keys_with_prefix("@sisa:data:").unwrap();
    assert_eq!(keys, vec!["@sisa:data:a", "@sisa:data:b"]);

    assert_eq!(storage.remove_prefix("@sisa:data:").unwrap(), 2);
    assert_eq!(storage.get_raw("@sisa:data:a").unwrap(), None);
    assert_eq!(storage.get_raw("@sisa:file:1").unwrap().as_deref(), Some("3"));
  }

  #[test]
  fn test_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");

    SqliteStorage::open(&path).unwrap().set_raw("ledger", "{\"total\":3}").unwrap();

    let reopened = SqliteStorage::open(&path).unwrap();
    assert_eq!(reopened.get_raw("ledger").unwrap().as_deref(), Some("{\"total\":3}"));
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage.set_raw("k", "v").unwrap();
    assert_eq!(storage.get_raw("k").unwrap(), None);
  }
}
