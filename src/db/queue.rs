//! Durable queue of writes the server has not confirmed yet.
//!
//! Rows are only ever changed through the operations here. The replay driver
//! reads them in FIFO order and either deletes them (confirmed) or records the
//! failure and leaves them for a later attempt.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Database;
use crate::offline::EntityId;

const QUEUE_COLUMNS: &str = "id, table_name, op, record_id, local_temp_id, payload_json, request_id, batch_id, status, last_error, created_at";

/// Kind of write waiting in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
  Create,
  Update,
  Delete,
}

impl QueueOperation {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueOperation::Create => "create",
      QueueOperation::Update => "update",
      QueueOperation::Delete => "delete",
    }
  }
}

/// Replay state of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
  Pending,
  Error,
  Done,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueStatus::Pending => "pending",
      QueueStatus::Error => "error",
      QueueStatus::Done => "done",
    }
  }
}

macro_rules! sql_text_enum {
  ($ty:ty { $($text:literal => $variant:expr),+ $(,)? }) => {
    impl FromStr for $ty {
      type Err = color_eyre::Report;

      fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
          $($text => Ok($variant),)+
          other => Err(eyre!("Unknown {}: {}", stringify!($ty), other)),
        }
      }
    }

    impl fmt::Display for $ty {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
      }
    }

    impl ToSql for $ty {
      fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
      }
    }

    impl FromSql for $ty {
      fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
          $($text => Ok($variant),)+
          _ => Err(FromSqlError::InvalidType),
        }
      }
    }
  };
}

sql_text_enum!(QueueOperation {
  "create" => QueueOperation::Create,
  "update" => QueueOperation::Update,
  "delete" => QueueOperation::Delete,
});

sql_text_enum!(QueueStatus {
  "pending" => QueueStatus::Pending,
  "error" => QueueStatus::Error,
  "done" => QueueStatus::Done,
});

/// A write to append to the queue.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
  pub table_name: String,
  pub operation: QueueOperation,
  pub payload: Value,
  pub record_id: Option<i64>,
  pub local_temp_id: Option<EntityId>,
  /// Idempotency key; generated when absent
  pub request_id: Option<String>,
}

impl NewQueueItem {
  pub fn new(table_name: impl Into<String>, operation: QueueOperation, payload: Value) -> Self {
    Self {
      table_name: table_name.into(),
      operation,
      payload,
      record_id: None,
      local_temp_id: None,
      request_id: None,
    }
  }

  pub fn with_record_id(mut self, record_id: i64) -> Self {
    self.record_id = Some(record_id);
    self
  }

  pub fn with_temp_id(mut self, temp_id: EntityId) -> Self {
    self.local_temp_id = Some(temp_id);
    self
  }

  pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
    self.request_id = Some(request_id.into());
    self
  }
}

/// A queued write as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncQueueItem {
  pub id: i64,
  pub table_name: String,
  pub operation: QueueOperation,
  pub record_id: Option<i64>,
  pub local_temp_id: Option<EntityId>,
  /// Payload exactly as it was enqueued
  pub payload_json: String,
  pub request_id: String,
  pub batch_id: Option<String>,
  pub status: QueueStatus,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
}

impl SyncQueueItem {
  /// Decode the payload into the shape the caller expects.
  pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_str(&self.payload_json)
      .map_err(|e| eyre!("Failed to decode payload of queue item {}: {}", self.id, e))
  }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
  let local_temp_id: Option<i64> = row.get(4)?;
  let created_at: i64 = row.get(10)?;
  Ok(SyncQueueItem {
    id: row.get(0)?,
    table_name: row.get(1)?,
    operation: row.get(2)?,
    record_id: row.get(3)?,
    local_temp_id: local_temp_id.map(EntityId::from_raw),
    payload_json: row.get(5)?,
    request_id: row.get(6)?,
    batch_id: row.get(7)?,
    status: row.get(8)?,
    last_error: row.get(9)?,
    created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
  })
}

impl Database {
  /// Append a write to the queue and return its id.
  ///
  /// The row is committed before this returns. Enqueueing a `request_id`
  /// that is already queued returns the existing row's id.
  pub fn enqueue(&self, item: NewQueueItem) -> Result<i64> {
    let payload_json = serde_json::to_string(&item.payload)
      .map_err(|e| eyre!("Failed to serialize queue payload: {}", e))?;
    let request_id = item
      .request_id
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = Utc::now().timestamp_millis();

    let conn = self.conn()?;
    let inserted = conn
      .execute(
        "INSERT OR IGNORE INTO sync_queue
           (table_name, op, record_id, local_temp_id, payload_json, request_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
          item.table_name,
          item.operation,
          item.record_id,
          item.local_temp_id.map(EntityId::raw),
          payload_json,
          request_id,
          QueueStatus::Pending,
          created_at,
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {} on {}: {}", item.operation, item.table_name, e))?;

    if inserted == 0 {
      let existing: i64 = conn
        .query_row(
          "SELECT id FROM sync_queue WHERE request_id = ?1",
          params![request_id],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to look up queued request {}: {}", request_id, e))?;
      debug!(queue_id = existing, request_id = %request_id, "Request already queued");
      return Ok(existing);
    }

    let id = conn.last_insert_rowid();
    info!(queue_id = id, table = %item.table_name, op = %item.operation, "Queued offline write");
    Ok(id)
  }

  /// Every queued item, oldest first.
  pub fn list_all(&self) -> Result<Vec<SyncQueueItem>> {
    self.query_queue(&format!("SELECT {} FROM sync_queue ORDER BY id ASC", QUEUE_COLUMNS))
  }

  /// Items still owed to the server, oldest first.
  pub fn list_replayable(&self) -> Result<Vec<SyncQueueItem>> {
    self.query_queue(&format!(
      "SELECT {} FROM sync_queue WHERE status IN ('pending', 'error') ORDER BY id ASC",
      QUEUE_COLUMNS
    ))
  }

  pub fn get_queue_item(&self, id: i64) -> Result<Option<SyncQueueItem>> {
    let conn = self.conn()?;
    conn
      .query_row(
        &format!("SELECT {} FROM sync_queue WHERE id = ?1", QUEUE_COLUMNS),
        params![id],
        item_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load queue item {}: {}", id, e))
  }

  fn query_queue(&self, sql: &str) -> Result<Vec<SyncQueueItem>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let items = stmt
      .query_map([], item_from_row)
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    Ok(items)
  }

  pub fn update_status(&self, id: i64, status: QueueStatus, last_error: Option<&str>) -> Result<bool> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE sync_queue SET status = ?1, last_error = ?2 WHERE id = ?3",
        params![status, last_error, id],
      )
      .map_err(|e| eyre!("Failed to update queue item {}: {}", id, e))?;

    if changed == 0 {
      warn!(queue_id = id, "Status update for unknown queue item");
    }
    Ok(changed > 0)
  }

  /// The server confirmed the write; the row is no longer needed.
  pub fn mark_done(&self, id: i64) -> Result<bool> {
    let removed = self.remove(id)?;
    debug!(queue_id = id, "Queue item confirmed");
    Ok(removed)
  }

  /// Record a failed replay, keeping the row for a later retry.
  pub fn mark_error(&self, id: i64, message: &str) -> Result<bool> {
    self.update_status(id, QueueStatus::Error, Some(message))
  }

  pub fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
      .map_err(|e| eyre!("Failed to remove queue item {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Drop the whole queue. Unsynced writes are lost.
  pub fn clear_queue(&self) -> Result<usize> {
    let conn = self.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_queue", [])
      .map_err(|e| eyre!("Failed to clear sync queue: {}", e))?;
    warn!(count = removed, "Cleared sync queue");
    Ok(removed)
  }

  pub fn count_replayable(&self) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'error')",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queue items: {}", e))
  }

  /// Batch id used as the idempotency key when replaying `id`, assigned on
  /// first use so retries reuse it.
  pub fn assign_batch_id(&self, id: i64) -> Result<String> {
    let conn = self.conn()?;
    let existing: Option<Option<String>> = conn
      .query_row(
        "SELECT batch_id FROM sync_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read batch id of queue item {}: {}", id, e))?;

    match existing {
      None => Err(eyre!("Queue item {} does not exist", id)),
      Some(Some(batch_id)) => Ok(batch_id),
      Some(None) => {
        let batch_id = Uuid::new_v4().to_string();
        conn
          .execute(
            "UPDATE sync_queue SET batch_id = ?1 WHERE id = ?2",
            params![batch_id, id],
          )
          .map_err(|e| eyre!("Failed to assign batch id to queue item {}: {}", id, e))?;
        Ok(batch_id)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn create_client(name: &str) -> NewQueueItem {
    NewQueueItem::new("clients", QueueOperation::Create, json!({ "business_name": name }))
  }

  #[test]
  fn test_enqueue_lists_in_fifo_order() {
    let db = Database::open_in_memory().unwrap();

    let first = db.enqueue(create_client("a").with_temp_id(EntityId::Temporary(3))).unwrap();
    let second = db
      .enqueue(NewQueueItem::new("clients", QueueOperation::Delete, json!({})).with_record_id(9))
      .unwrap();

    let items = db.list_all().unwrap();
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![first, second]);
    assert_eq!(items[0].status, QueueStatus::Pending);
    assert_eq!(items[0].local_temp_id, Some(EntityId::Temporary(3)));
    assert_eq!(items[1].operation, QueueOperation::Delete);
    assert_eq!(items[1].record_id, Some(9));
  }

  #[test]
  fn test_payload_is_returned_verbatim() {
    let db = Database::open_in_memory().unwrap();
    let payload = json!({ "nested": { "list": [1, 2, 3] }, "note": "ñandú" });

    db.enqueue(NewQueueItem::new("jobs", QueueOperation::Update, payload.clone()))
      .unwrap();

    let item = &db.list_all().unwrap()[0];
    assert_eq!(item.payload_json, serde_json::to_string(&payload).unwrap());
    assert_eq!(item.payload::<Value>().unwrap(), payload);
  }

  #[test]
  fn test_enqueue_same_request_is_idempotent() {
    let db = Database::open_in_memory().unwrap();

    let a = db.enqueue(create_client("a").with_request_id("req-1")).unwrap();
    let b = db.enqueue(create_client("a").with_request_id("req-1")).unwrap();

    assert_eq!(a, b);
    assert_eq!(db.list_all().unwrap().len(), 1);
  }

  #[test]
  fn test_error_keeps_item_and_done_removes_it() {
    let db = Database::open_in_memory().unwrap();
    let failing = db.enqueue(create_client("a")).unwrap();
    let confirmed = db.enqueue(create_client("b")).unwrap();

    assert!(db.mark_error(failing, "HTTP 500").unwrap());
    assert!(db.mark_done(confirmed).unwrap());

    let replayable = db.list_replayable().unwrap();
    assert_eq!(replayable.len(), 1);
    assert_eq!(replayable[0].status, QueueStatus::Error);
    assert_eq!(replayable[0].last_error.as_deref(), Some("HTTP 500"));
    assert_eq!(db.count_replayable().unwrap(), 1);
  }

  #[test]
  fn test_done_status_is_not_replayable() {
    let db = Database::open_in_memory().unwrap();
    let id = db.enqueue(create_client("a")).unwrap();

    assert!(db.update_status(id, QueueStatus::Done, None).unwrap());

    assert!(db.list_replayable().unwrap().is_empty());
    assert_eq!(db.list_all().unwrap().len(), 1);
    assert!(!db.update_status(999, QueueStatus::Error, Some("x")).unwrap());
  }

  #[test]
  fn test_batch_id_is_stable() {
    let db = Database::open_in_memory().unwrap();
    let id = db.enqueue(create_client("a")).unwrap();

    let first = db.assign_batch_id(id).unwrap();
    let second = db.assign_batch_id(id).unwrap();

    assert_eq!(first, second);
    assert!(db.assign_batch_id(id + 100).is_err());
  }

  #[test]
  fn test_queue_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sisa.db");

    let id = {
      let db = Database::open(&path).unwrap();
      db.enqueue(create_client("offline")).unwrap()
    };

    let db = Database::open(&path).unwrap();
    let items = db.list_all().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, id);

    assert!(db.remove(id).unwrap());
    drop(db);
    assert!(Database::open(&path).unwrap().list_all().unwrap().is_empty());
  }

  #[test]
  fn test_parse_operation_and_status() {
    assert_eq!("Create".parse::<QueueOperation>().unwrap(), QueueOperation::Create);
    assert_eq!("error".parse::<QueueStatus>().unwrap(), QueueStatus::Error);
    assert!("upsert".parse::<QueueOperation>().is_err());
  }
}
