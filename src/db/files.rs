//! File records mirrored from the server and their attachment links.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info, warn};

use super::Database;

const FILE_COLUMNS: &str =
  "id, name, mime, size, checksum, local_path, downloaded, created_at, updated_at";

/// A remote file and where (if anywhere) its bytes live locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
  pub id: i64,
  pub name: String,
  pub mime: String,
  pub size: i64,
  pub checksum: Option<String>,
  pub local_path: Option<String>,
  /// Only true while `local_path` points to the file's bytes
  pub downloaded: bool,
  pub created_at: Option<String>,
  pub updated_at: Option<String>,
}

impl FileRecord {
  /// A record for a file that has not been downloaded yet.
  pub fn remote(id: i64, name: impl Into<String>, mime: impl Into<String>, size: i64) -> Self {
    Self {
      id,
      name: name.into(),
      mime: mime.into(),
      size,
      checksum: None,
      local_path: None,
      downloaded: false,
      created_at: None,
      updated_at: None,
    }
  }
}

/// "This entity has this attachment at this position."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFileLink {
  pub entity_type: String,
  pub entity_id: i64,
  pub file_id: i64,
  pub position: Option<i64>,
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
  let mime: String = row.get(2)?;
  Ok(FileRecord {
    id: row.get(0)?,
    name: row.get(1)?,
    mime: if mime.is_empty() {
      "application/octet-stream".to_string()
    } else {
      mime
    },
    size: row.get(3)?,
    checksum: row.get(4)?,
    local_path: row.get(5)?,
    downloaded: row.get(6)?,
    created_at: row.get(7)?,
    updated_at: row.get(8)?,
  })
}

impl Database {
  /// Insert or replace the metadata of a file, keeping the first known
  /// `created_at`.
  pub fn upsert_file(&self, record: &FileRecord) -> Result<()> {
    let downloaded = record.downloaded && record.local_path.is_some();
    if record.downloaded && !downloaded {
      warn!(file_id = record.id, "File marked downloaded without a local path, storing as pending");
    }

    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO files (id, name, mime, size, checksum, local_path, downloaded, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           mime = excluded.mime,
           size = excluded.size,
           checksum = excluded.checksum,
           local_path = excluded.local_path,
           downloaded = excluded.downloaded,
           created_at = COALESCE(excluded.created_at, files.created_at),
           updated_at = excluded.updated_at",
        params![
          record.id,
          record.name,
          record.mime,
          record.size,
          record.checksum,
          record.local_path,
          downloaded,
          record.created_at,
          record.updated_at,
        ],
      )
      .map_err(|e| eyre!("Failed to store file {}: {}", record.id, e))?;

    Ok(())
  }

  pub fn get_file(&self, file_id: i64) -> Result<Option<FileRecord>> {
    let conn = self.conn()?;
    conn
      .query_row(
        &format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS),
        params![file_id],
        file_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load file {}: {}", file_id, e))
  }

  /// Record that the bytes of a file are now available at `local_path`.
  pub fn mark_file_downloaded(
    &self,
    file_id: i64,
    local_path: &str,
    checksum: Option<&str>,
    updated_at: Option<&str>,
  ) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE files
         SET downloaded = 1,
             local_path = ?1,
             checksum = COALESCE(?2, checksum),
             updated_at = COALESCE(?3, updated_at)
         WHERE id = ?4",
        params![local_path, checksum, updated_at, file_id],
      )
      .map_err(|e| eyre!("Failed to mark file {} as downloaded: {}", file_id, e))?;

    Ok(changed > 0)
  }

  /// Forget the local copy of a file; it will show up as pending download.
  pub fn mark_file_missing(&self, file_id: i64) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE files SET downloaded = 0, local_path = NULL WHERE id = ?1",
        params![file_id],
      )
      .map_err(|e| eyre!("Failed to mark file {} as missing: {}", file_id, e))?;

    Ok(changed > 0)
  }

  /// Files whose bytes still need to be fetched.
  pub fn files_pending_download(&self) -> Result<Vec<FileRecord>> {
    self.query_files(
      &format!("SELECT {} FROM files WHERE downloaded = 0 ORDER BY id", FILE_COLUMNS),
      [],
    )
  }

  /// Attachments of an entity, ordered by position.
  pub fn files_for_entity(&self, entity_type: &str, entity_id: i64) -> Result<Vec<FileRecord>> {
    self.query_files(
      "SELECT f.id, f.name, f.mime, f.size, f.checksum, f.local_path, f.downloaded, f.created_at, f.updated_at
       FROM files f
       INNER JOIN entity_files ef ON ef.file_id = f.id
       WHERE ef.entity_type = ?1 AND ef.entity_id = ?2
       ORDER BY ef.position ASC, f.id ASC",
      params![entity_type, entity_id],
    )
  }

  fn query_files<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<FileRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare file query: {}", e))?;

    let files = stmt
      .query_map(params, file_from_row)
      .map_err(|e| eyre!("Failed to query files: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read file row: {}", e))?;

    Ok(files)
  }

  /// Link files to entities. An existing link only has its position updated.
  pub fn upsert_entity_links(&self, links: &[EntityFileLink]) -> Result<()> {
    if links.is_empty() {
      return Ok(());
    }

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for link in links {
      tx.execute(
        "INSERT INTO entity_files (entity_type, entity_id, file_id, position)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entity_type, entity_id, file_id) DO UPDATE SET position = excluded.position",
        params![link.entity_type, link.entity_id, link.file_id, link.position],
      )
      .map_err(|e| eyre!("Failed to link file {} to {}:{}: {}", link.file_id, link.entity_type, link.entity_id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit file links: {}", e))?;

    Ok(())
  }

  /// Drop every attachment link of an entity. The file records stay.
  pub fn remove_entity_links(&self, entity_type: &str, entity_id: i64) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM entity_files WHERE entity_type = ?1 AND entity_id = ?2",
        params![entity_type, entity_id],
      )
      .map_err(|e| eyre!("Failed to unlink files from {}:{}: {}", entity_type, entity_id, e))
  }

  /// Delete all file records and links, returning what was removed so the
  /// caller can delete the local bytes.
  pub fn remove_all_files(&self) -> Result<Vec<FileRecord>> {
    let existing = self.query_files(&format!("SELECT {} FROM files ORDER BY id", FILE_COLUMNS), [])?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM entity_files", [])
      .map_err(|e| eyre!("Failed to clear file links: {}", e))?;
    tx.execute("DELETE FROM files", [])
      .map_err(|e| eyre!("Failed to clear files: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit file cleanup: {}", e))?;

    info!(count = existing.len(), "Removed cached file records");
    Ok(existing)
  }

  /// Demote downloaded records whose bytes are gone or no longer match their
  /// checksum. Returns the ids that were marked missing.
  pub fn verify_downloads(&self) -> Result<Vec<i64>> {
    let downloaded = self.query_files(
      &format!("SELECT {} FROM files WHERE downloaded = 1 ORDER BY id", FILE_COLUMNS),
      [],
    )?;

    let mut missing = Vec::new();
    for record in downloaded {
      if !local_copy_is_valid(&record) {
        self.mark_file_missing(record.id)?;
        missing.push(record.id);
      }
    }

    if !missing.is_empty() {
      info!(count = missing.len(), "Marked files with missing local copies");
    }
    Ok(missing)
  }
}

fn local_copy_is_valid(record: &FileRecord) -> bool {
  let Some(path) = record.local_path.as_deref() else {
    return false;
  };

  let bytes = match std::fs::read(Path::new(path)) {
    Ok(bytes) => bytes,
    Err(e) => {
      debug!(file_id = record.id, path, "Local copy unreadable: {}", e);
      return false;
    }
  };

  match record.checksum.as_deref() {
    Some(expected) => {
      let actual = hex::encode(Sha256::digest(&bytes));
      let matches = actual.eq_ignore_ascii_case(expected);
      if !matches {
        warn!(file_id = record.id, "Checksum mismatch for local copy");
      }
      matches
    }
    None => true,
  }
}
