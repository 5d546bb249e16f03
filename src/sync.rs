//! Replay of queued writes against the server.
//!
//! The driver only decides what happens to each queue row; sending the write
//! is up to the caller's `submit` closure, and so is deciding when to replay.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{Database, QueueOperation, SyncQueueItem};
use crate::offline::{confirm_temporary, EntityId, OfflineRecord};

/// What the server reported for one confirmed write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
  /// Id assigned by the server, for creates
  pub remote_id: Option<i64>,
  /// Record version after the write, when the server tracks one
  pub version: Option<i64>,
}

/// A temporary id the server replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedId {
  pub temporary: EntityId,
  pub remote_id: i64,
  /// Version of the created record; 1 when the server did not report one
  pub version: i64,
}

/// The queue item replay stopped at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
  pub queue_id: i64,
  pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Items confirmed and removed from the queue
  pub confirmed: usize,
  pub failed: Option<ReplayFailure>,
  /// Items still waiting after this run
  pub remaining: usize,
  pub resolved: Vec<ResolvedId>,
}

impl ReplayReport {
  /// Swap every resolved temporary id in `items` for its server id and store
  /// the confirmed version. Returns how many records changed.
  pub fn apply_to<T: OfflineRecord>(&self, items: &mut [T]) -> usize {
    let mut changed = 0;
    for resolved in &self.resolved {
      if !confirm_temporary(items, resolved.temporary, resolved.remote_id) {
        continue;
      }
      changed += 1;
      let confirmed = EntityId::Confirmed(resolved.remote_id);
      for item in items.iter_mut().filter(|item| item.id() == confirmed) {
        item.set_version(resolved.version);
      }
    }
    changed
  }
}

/// Run one queue statement on the blocking pool.
async fn with_db<R, F>(db: &Arc<Database>, op: F) -> Result<R>
where
  R: Send + 'static,
  F: FnOnce(&Database) -> Result<R> + Send + 'static,
{
  let db = Arc::clone(db);
  tokio::task::spawn_blocking(move || op(&db))
    .await
    .map_err(|e| eyre!("Sync queue task failed: {}", e))?
}

/// Replay queued writes in FIFO order.
///
/// Each item gets a stable batch id before it is handed to `submit`, so a
/// retried item reuses its idempotency key. A confirmed item is deleted; the
/// first failure is recorded on its row and stops the run, so later writes
/// never overtake an earlier one. Queue statements run on the blocking pool.
pub async fn replay<F, Fut>(db: &Arc<Database>, mut submit: F) -> Result<ReplayReport>
where
  F: FnMut(SyncQueueItem) -> Fut,
  Fut: Future<Output = Result<Confirmation>>,
{
  let items = with_db(db, |db| db.list_replayable()).await?;
  let mut report = ReplayReport::default();
  debug!(count = items.len(), "Replaying sync queue");

  for mut item in items {
    let queue_id = item.id;
    let operation = item.operation;
    let temporary = item.local_temp_id;
    item.batch_id = Some(with_db(db, move |db| db.assign_batch_id(queue_id)).await?);

    match submit(item).await {
      Ok(confirmation) => {
        with_db(db, move |db| db.mark_done(queue_id)).await?;
        report.confirmed += 1;

        if let (QueueOperation::Create, Some(temporary), Some(remote_id)) =
          (operation, temporary, confirmation.remote_id)
        {
          report.resolved.push(ResolvedId {
            temporary,
            remote_id,
            version: confirmation.version.unwrap_or(1),
          });
        }
      }
      Err(e) => {
        let message = e.to_string();
        warn!(queue_id, "Replay failed, stopping: {}", message);
        let recorded = message.clone();
        with_db(db, move |db| db.mark_error(queue_id, &recorded)).await?;
        report.failed = Some(ReplayFailure { queue_id, message });
        break;
      }
    }
  }

  report.remaining = with_db(db, |db| db.count_replayable()).await?;
  info!(
    confirmed = report.confirmed,
    remaining = report.remaining,
    "Sync queue replay finished"
  );
  Ok(report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{NewQueueItem, QueueStatus};
  use crate::offline::SyncStatus;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::{Arc, Mutex};

  fn queue_with_three(db: &Database) -> EntityId {
    let temp = EntityId::new_temporary();
    db.enqueue(
      NewQueueItem::new("clients", QueueOperation::Create, json!({ "name": "Acme" })).with_temp_id(temp),
    )
    .unwrap();
    db.enqueue(NewQueueItem::new("clients", QueueOperation::Update, json!({ "name": "Beta" })).with_record_id(4))
      .unwrap();
    db.enqueue(NewQueueItem::new("clients", QueueOperation::Delete, json!({})).with_record_id(5))
      .unwrap();
    temp
  }

  #[tokio::test]
  async fn test_replay_confirms_in_fifo_order() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let temp = queue_with_three(&db);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let report = replay(&db, |item| {
      let seen = Arc::clone(&seen);
      async move {
        seen.lock().unwrap().push(item.operation);
        assert!(item.batch_id.is_some());
        Ok(Confirmation {
          remote_id: Some(100 + item.id),
          version: (item.operation == QueueOperation::Create).then_some(4),
        })
      }
    })
    .await
    .unwrap();

    assert_eq!(
      *seen.lock().unwrap(),
      vec![QueueOperation::Create, QueueOperation::Update, QueueOperation::Delete]
    );
    assert_eq!(report.confirmed, 3);
    assert_eq!(report.remaining, 0);
    assert!(report.failed.is_none());
    assert_eq!(report.resolved.len(), 1);
    assert_eq!(report.resolved[0].temporary, temp);
    assert_eq!(report.resolved[0].version, 4);
    assert!(db.list_all().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_replay_stops_at_first_failure() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    queue_with_three(&db);
    let mut calls = 0;

    let report = replay(&db, |item| {
      calls += 1;
      async move {
        match item.operation {
          QueueOperation::Update => Err(eyre!("HTTP 409")),
          _ => Ok(Confirmation::default()),
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(calls, 2);
    assert_eq!(report.confirmed, 1);
    assert_eq!(report.remaining, 2);
    let failure = report.failed.unwrap();
    assert_eq!(failure.message, "HTTP 409");

    let failed = db.get_queue_item(failure.queue_id).unwrap().unwrap();
    assert_eq!(failed.status, QueueStatus::Error);
    assert_eq!(failed.last_error.as_deref(), Some("HTTP 409"));
  }

  #[tokio::test]
  async fn test_retry_reuses_batch_id_and_retries_errors() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.enqueue(NewQueueItem::new("clients", QueueOperation::Delete, json!({})).with_record_id(9))
      .unwrap();
    let batches = Arc::new(Mutex::new(Vec::new()));

    for attempt in 0..2 {
      let batches = Arc::clone(&batches);
      replay(&db, move |item| {
        let batches = Arc::clone(&batches);
        async move {
          batches.lock().unwrap().push(item.batch_id.clone());
          if attempt == 0 {
            Err(eyre!("offline"))
          } else {
            Ok(Confirmation::default())
          }
        }
      })
      .await
      .unwrap();
    }

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], batches[1]);
    assert_eq!(db.count_replayable().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_queue_statements_leave_the_runtime_thread() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let runtime_thread = std::thread::current().id();

    let statement_thread = with_db(&db, |db| {
      db.count_replayable()?;
      Ok(std::thread::current().id())
    })
    .await
    .unwrap();

    assert_ne!(statement_thread, runtime_thread);
  }

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Client {
    id: EntityId,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_status: Option<SyncStatus>,
    version: i64,
  }

  impl OfflineRecord for Client {
    fn id(&self) -> EntityId {
      self.id
    }

    fn set_id(&mut self, id: EntityId) {
      self.id = id;
    }

    fn sync_status(&self) -> Option<SyncStatus> {
      self.sync_status
    }

    fn set_sync_status(&mut self, status: Option<SyncStatus>) {
      self.sync_status = status;
    }

    fn pending_delete(&self) -> bool {
      false
    }

    fn set_version(&mut self, version: i64) {
      self.version = version;
    }
  }

  #[test]
  fn test_report_resolves_temporary_ids() {
    let temp = EntityId::new_temporary();
    let mut clients = vec![
      Client {
        id: EntityId::Confirmed(1),
        name: "Old".to_string(),
        sync_status: None,
        version: 2,
      },
      Client {
        id: temp,
        name: "New".to_string(),
        sync_status: Some(SyncStatus::Pending),
        version: 1,
      },
    ];
    let report = ReplayReport {
      confirmed: 1,
      resolved: vec![ResolvedId {
        temporary: temp,
        remote_id: 77,
        version: 3,
      }],
      ..Default::default()
    };

    assert_eq!(report.apply_to(&mut clients), 1);
    assert_eq!(clients[1].id, EntityId::Confirmed(77));
    assert_eq!(clients[1].sync_status, None);
    assert_eq!(clients[1].version, 3);
    assert_eq!(clients[0].version, 2);
  }
}
