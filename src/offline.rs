//! Reconciles the last known server snapshot of a collection with records
//! the server has not confirmed yet.
//!
//! A record is pending when it carries a temporary id, is flagged
//! `syncStatus = "pending"`, or is marked for deletion. `merge` overlays those
//! records on the snapshot so the rendered collection reflects the user's
//! latest unsynced intent. Precedence is simple: the pending record wins.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

/// Identity of a record as seen by the client.
///
/// On the wire both variants are a single signed integer: server ids are
/// non-negative, temporary ids are stored negated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
  /// Id assigned by the server
  Confirmed(i64),
  /// Client-assigned id for a record awaiting its first sync
  Temporary(u64),
}

/// Source of temporary ids, seeded from the wall clock on first use so ids
/// handed out after a restart do not collide with ones already queued.
static NEXT_TEMPORARY: OnceLock<AtomicU64> = OnceLock::new();

/// Largest temporary id that still fits the negated wire form
pub const MAX_TEMPORARY: u64 = i64::MAX as u64;

impl EntityId {
  /// Checked temporary id. Zero would encode as a confirmed id and anything
  /// above [`MAX_TEMPORARY`] has no wire form.
  pub fn temporary(id: u64) -> Result<Self> {
    if id == 0 || id > MAX_TEMPORARY {
      return Err(eyre!("Temporary id must be between 1 and {}, got {}", MAX_TEMPORARY, id));
    }
    Ok(EntityId::Temporary(id))
  }

  /// Decode the signed wire representation.
  pub fn from_raw(raw: i64) -> Self {
    if raw < 0 {
      EntityId::Temporary(raw.unsigned_abs())
    } else {
      EntityId::Confirmed(raw)
    }
  }

  /// Like [`EntityId::from_raw`], but `None` for `i64::MIN`, whose magnitude
  /// cannot be encoded again.
  pub fn try_from_raw(raw: i64) -> Option<Self> {
    (raw != i64::MIN).then(|| Self::from_raw(raw))
  }

  /// Encode as the signed wire representation.
  pub fn raw(self) -> i64 {
    match self {
      EntityId::Confirmed(id) => id,
      EntityId::Temporary(id) => -i64::try_from(id).unwrap_or(i64::MAX),
    }
  }

  /// Allocate a fresh temporary id, unique within this process.
  pub fn new_temporary() -> Self {
    let counter = NEXT_TEMPORARY.get_or_init(|| {
      let seed = Utc::now().timestamp_millis().max(1) as u64;
      AtomicU64::new(seed)
    });
    EntityId::Temporary(counter.fetch_add(1, Ordering::SeqCst))
  }

  pub fn is_temporary(self) -> bool {
    matches!(self, EntityId::Temporary(_))
  }

  /// The server id, if this id has been confirmed.
  pub fn confirmed(self) -> Option<i64> {
    match self {
      EntityId::Confirmed(id) => Some(id),
      EntityId::Temporary(_) => None,
    }
  }
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EntityId::Confirmed(id) => write!(f, "{}", id),
      EntityId::Temporary(id) => write!(f, "tmp:{}", id),
    }
  }
}

impl Serialize for EntityId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(self.raw())
  }
}

impl<'de> Deserialize<'de> for EntityId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = i64::deserialize(deserializer)?;
    EntityId::try_from_raw(raw).ok_or_else(|| D::Error::custom(format!("id {} is out of range", raw)))
  }
}

/// Unconfirmed state a record can carry alongside its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  /// Waiting for the replay driver
  Pending,
  /// Last replay attempt failed
  Error,
}

/// A domain entity that can exist in a pending state on the client.
pub trait OfflineRecord: Clone + Serialize + DeserializeOwned {
  fn id(&self) -> EntityId;

  fn set_id(&mut self, id: EntityId);

  fn sync_status(&self) -> Option<SyncStatus>;

  fn set_sync_status(&mut self, status: Option<SyncStatus>);

  fn pending_delete(&self) -> bool;

  /// Store the version the server reported after confirming this record.
  /// Records without optimistic versioning ignore it.
  fn set_version(&mut self, _version: i64) {}

  /// Whether this record belongs to the pending set considered by `merge`.
  fn is_pending(&self) -> bool {
    self.id().is_temporary()
      || self.sync_status() == Some(SyncStatus::Pending)
      || self.pending_delete()
  }

  /// This record overwritten field by field with `pending`.
  ///
  /// Fields the pending record does not serialize (e.g. `None` values skipped
  /// by serde) keep their snapshot value.
  fn overlay(&self, pending: &Self) -> Self {
    match overlay_fields(self, pending) {
      Ok(merged) => merged,
      Err(e) => {
        warn!(id = %pending.id(), "Field overlay failed, using pending record as-is: {}", e);
        pending.clone()
      }
    }
  }
}

fn overlay_fields<T: Serialize + DeserializeOwned>(base: &T, top: &T) -> serde_json::Result<T> {
  let mut merged = serde_json::to_value(base)?;
  let top = serde_json::to_value(top)?;

  match (&mut merged, top) {
    (Value::Object(fields), Value::Object(overrides)) => {
      for (name, value) in overrides {
        fields.insert(name, value);
      }
    }
    (slot, other) => *slot = other,
  }

  serde_json::from_value(merged)
}

/// Merge a server snapshot with in-memory pending records.
///
/// Snapshot order is kept (minus pending deletions), followed by newly created
/// pending records in their original order. When nothing in `pending_items`
/// is pending, the snapshot is returned borrowed and untouched.
///
/// Callers must keep at most one pending record per id. With duplicates, the
/// first pending match is applied to the snapshot record.
pub fn merge<'a, T: OfflineRecord>(snapshot: &'a [T], pending_items: &[T]) -> Cow<'a, [T]> {
  let pending: Vec<&T> = pending_items.iter().filter(|item| item.is_pending()).collect();
  if pending.is_empty() {
    return Cow::Borrowed(snapshot);
  }

  let snapshot_ids: HashSet<EntityId> = snapshot.iter().map(|item| item.id()).collect();
  let mut merged = Vec::with_capacity(snapshot.len() + pending.len());

  for item in snapshot {
    match pending.iter().find(|p| p.id() == item.id()) {
      Some(p) if p.pending_delete() => {}
      Some(p) => merged.push(item.overlay(p)),
      None => merged.push(item.clone()),
    }
  }

  for p in pending {
    let is_new = p.id().is_temporary() || !snapshot_ids.contains(&p.id());
    if is_new && !p.pending_delete() {
      merged.push(p.clone());
    }
  }

  Cow::Owned(merged)
}

/// Swap a temporary id for the id the server assigned and clear the pending
/// flag. Returns whether any record matched.
pub fn confirm_temporary<T: OfflineRecord>(items: &mut [T], temporary: EntityId, remote_id: i64) -> bool {
  let mut found = false;
  for item in items.iter_mut().filter(|item| item.id() == temporary) {
    item.set_id(EntityId::Confirmed(remote_id));
    item.set_sync_status(None);
    found = true;
  }
  found
}
