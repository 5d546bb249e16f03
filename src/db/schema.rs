//! Versioned schema for the local relational store.
//!
//! Each migration is applied at most once; the applied version is tracked in
//! `PRAGMA user_version`.

/// Schema version this build expects.
pub const SCHEMA_VERSION: u32 = 2;

/// A versioned group of DDL statements.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
  pub version: u32,
  pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    statements: &[
      CREATE_TABLE_FILES,
      CREATE_INDEX_FILES_DOWNLOADED,
      CREATE_INDEX_FILES_UPDATED_AT,
      CREATE_TABLE_ENTITY_FILES,
      CREATE_INDEX_ENTITY_FILES,
    ],
  },
  Migration {
    version: 2,
    statements: &[
      CREATE_TABLE_SYNC_QUEUE,
      CREATE_INDEX_SYNC_QUEUE_REQUEST,
      CREATE_INDEX_SYNC_QUEUE_STATUS,
    ],
  },
];

/// Remote files mirrored to local storage
pub const CREATE_TABLE_FILES: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    mime TEXT NOT NULL,
    size INTEGER NOT NULL,
    checksum TEXT,
    local_path TEXT,
    downloaded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    updated_at TEXT
);
"#;

pub const CREATE_INDEX_FILES_DOWNLOADED: &str =
  "CREATE INDEX IF NOT EXISTS idx_files_downloaded ON files(downloaded);";

pub const CREATE_INDEX_FILES_UPDATED_AT: &str =
  "CREATE INDEX IF NOT EXISTS idx_files_updated_at ON files(updated_at);";

/// Attachment links between domain entities and files
pub const CREATE_TABLE_ENTITY_FILES: &str = r#"
CREATE TABLE IF NOT EXISTS entity_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    file_id INTEGER NOT NULL,
    position INTEGER,
    UNIQUE(entity_type, entity_id, file_id)
);
"#;

pub const CREATE_INDEX_ENTITY_FILES: &str =
  "CREATE INDEX IF NOT EXISTS idx_entity_files_entity ON entity_files(entity_type, entity_id);";

/// Writes waiting to be replayed against the server
pub const CREATE_TABLE_SYNC_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    op TEXT NOT NULL,
    record_id INTEGER,
    local_temp_id INTEGER,
    payload_json TEXT NOT NULL,
    batch_id TEXT,
    request_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    created_at INTEGER NOT NULL
);
"#;

pub const CREATE_INDEX_SYNC_QUEUE_REQUEST: &str =
  "CREATE UNIQUE INDEX IF NOT EXISTS uq_sync_queue_request ON sync_queue(request_id);";

pub const CREATE_INDEX_SYNC_QUEUE_STATUS: &str =
  "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, id);";
