//! Local relational store: mirrored file records, entity attachments and the
//! durable sync queue, behind one SQLite connection.

pub mod files;
pub mod queue;
pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use schema::{Migration, MIGRATIONS, SCHEMA_VERSION};

pub use files::{EntityFileLink, FileRecord};
pub use queue::{NewQueueItem, QueueOperation, QueueStatus, SyncQueueItem};

/// Database connection wrapper for the local mirror
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, applying pending migrations.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    // Queue writes must be on disk before enqueue returns
    conn
      .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA foreign_keys = OFF;")
      .map_err(|e| eyre!("Failed to configure database: {}", e))?;

    Self::from_connection(conn)
  }

  /// Open or create the database at the default location
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    run_migrations(&mut conn, MIGRATIONS, SCHEMA_VERSION)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::default_data_dir()?.join("sisa.db"))
  }

  /// Schema version currently stored in the database.
  pub fn schema_version(&self) -> Result<u32> {
    let conn = self.conn()?;
    read_schema_version(&conn)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn read_schema_version(conn: &Connection) -> Result<u32> {
  conn
    .pragma_query_value(None, "user_version", |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

/// Bring the schema from its stored version up to `target`.
///
/// Every migration above the stored version (and not above `target`) runs in
/// ascending order inside one transaction. Any failure rolls the whole upgrade
/// back. Returns the number of migrations applied.
pub fn run_migrations(conn: &mut Connection, migrations: &[Migration], target: u32) -> Result<usize> {
  let current = read_schema_version(conn)?;
  if current >= target {
    debug!(version = current, "Schema is up to date");
    return Ok(0);
  }

  let mut pending: Vec<&Migration> = migrations
    .iter()
    .filter(|m| m.version > current && m.version <= target)
    .collect();
  pending.sort_by_key(|m| m.version);

  // Dropping the transaction without commit rolls it back
  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin migration transaction: {}", e))?;

  for migration in &pending {
    for statement in migration.statements {
      tx.execute_batch(statement)
        .map_err(|e| eyre!("Migration to version {} failed: {}", migration.version, e))?;
    }
  }

  tx.pragma_update(None, "user_version", target)
    .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
  tx.commit()
    .map_err(|e| eyre!("Failed to commit migrations: {}", e))?;

  info!(from = current, to = target, applied = pending.len(), "Applied schema migrations");
  Ok(pending.len())
}

/// Lazily opened, process-wide database handle.
///
/// Concurrent first callers await the same in-flight open. A failed open is
/// not remembered, so the next call tries again.
pub struct SharedDatabase {
  cell: OnceCell<Arc<Database>>,
}

impl SharedDatabase {
  pub const fn new() -> Self {
    Self {
      cell: OnceCell::const_new(),
    }
  }

  /// Return the shared handle, opening it at `path` on first use.
  ///
  /// `path` is ignored once the handle exists.
  pub async fn get_or_open(&self, path: &Path) -> Result<Arc<Database>> {
    let db = self
      .cell
      .get_or_try_init(|| async {
        let path = path.to_path_buf();
        let db = tokio::task::spawn_blocking(move || Database::open(&path))
          .await
          .map_err(|e| eyre!("Database open task failed: {}", e))??;
        Ok::<_, color_eyre::Report>(Arc::new(db))
      })
      .await?;
    Ok(Arc::clone(db))
  }
}

impl Default for SharedDatabase {
  fn default() -> Self {
    Self::new()
  }
}

static DATABASE: SharedDatabase = SharedDatabase::new();

/// The process-wide database handle.
pub async fn shared_database(path: &Path) -> Result<Arc<Database>> {
  DATABASE.get_or_open(path).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn table_exists(conn: &Connection, name: &str) -> bool {
    conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get::<_, i64>(0),
      )
      .unwrap()
      > 0
  }

  #[test]
  fn test_open_in_memory_reaches_target_version() {
    let db = Database::open_in_memory().unwrap();

    assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    let conn = db.conn().unwrap();
    assert!(table_exists(&conn, "files"));
    assert!(table_exists(&conn, "entity_files"));
    assert!(table_exists(&conn, "sync_queue"));
  }

  #[test]
  fn test_migrations_are_not_reapplied() {
    // Without IF NOT EXISTS, running this twice would fail
    const SCRATCH: &[Migration] = &[Migration {
      version: 1,
      statements: &["CREATE TABLE scratch (x INTEGER)"],
    }];
    let mut conn = Connection::open_in_memory().unwrap();

    assert_eq!(run_migrations(&mut conn, SCRATCH, 1).unwrap(), 1);
    assert_eq!(run_migrations(&mut conn, SCRATCH, 1).unwrap(), 0);
    assert_eq!(read_schema_version(&conn).unwrap(), 1);
  }

  #[test]
  fn test_migrations_apply_only_newer_versions() {
    const STEPS: &[Migration] = &[
      Migration {
        version: 2,
        statements: &["CREATE TABLE second (x INTEGER)"],
      },
      Migration {
        version: 1,
        statements: &["CREATE TABLE first (x INTEGER)"],
      },
    ];
    let mut conn = Connection::open_in_memory().unwrap();

    assert_eq!(run_migrations(&mut conn, STEPS, 1).unwrap(), 1);
    assert!(table_exists(&conn, "first"));
    assert!(!table_exists(&conn, "second"));

    assert_eq!(run_migrations(&mut conn, STEPS, 2).unwrap(), 1);
    assert!(table_exists(&conn, "second"));
    assert_eq!(read_schema_version(&conn).unwrap(), 2);
  }

  #[test]
  fn test_failed_migration_rolls_back_everything() {
    const BROKEN: &[Migration] = &[
      Migration {
        version: 1,
        statements: &["CREATE TABLE good (x INTEGER)"],
      },
      Migration {
        version: 2,
        statements: &["CREATE TABLE also_good (x INTEGER)", "THIS IS NOT SQL"],
      },
    ];
    let mut conn = Connection::open_in_memory().unwrap();

    assert!(run_migrations(&mut conn, BROKEN, 2).is_err());
    assert_eq!(read_schema_version(&conn).unwrap(), 0);
    assert!(!table_exists(&conn, "good"));
    assert!(!table_exists(&conn, "also_good"));
  }

  #[test]
  fn test_reopen_file_database_is_noop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("sisa.db");

    drop(Database::open(&path).unwrap());
    let reopened = Database::open(&path).unwrap();

    assert_eq!(reopened.schema_version().unwrap(), SCHEMA_VERSION);
    let mut conn = reopened.conn().unwrap();
    assert_eq!(run_migrations(&mut conn, MIGRATIONS, SCHEMA_VERSION).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_shared_database_returns_single_handle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let shared = SharedDatabase::new();

    let (a, b) = tokio::join!(shared.get_or_open(&path), shared.get_or_open(&path));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    let c = shared.get_or_open(&dir.path().join("ignored.db")).await.unwrap();
    assert!(Arc::ptr_eq(&a, &c));
  }
}
