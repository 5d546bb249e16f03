//! Asynchronous, best-effort facade over a key-value backend.
//!
//! All operations go through one worker task and are applied in submission
//! order, so a read never overtakes an earlier write, even one submitted
//! fire-and-forget. Storage errors are logged and turned into misses/no-ops:
//! the in-memory state stays authoritative for the session.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::storage::KeyValueStorage;

/// Prefix of data cache entries
pub const DATA_PREFIX: &str = "@sisa:data:";
/// Prefix of file metadata entries
pub const FILE_PREFIX: &str = "@sisa:file:";
/// Prefix used for file metadata by older releases
pub const LEGACY_FILE_PREFIX: &str = "file_meta_";

/// Which group of entries a clear applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClearScope {
  /// Cached collections and settings
  Data,
  /// File metadata (current and legacy keys)
  Files,
}

impl ClearScope {
  fn prefixes(self) -> &'static [&'static str] {
    match self {
      ClearScope::Data => &[DATA_PREFIX],
      ClearScope::Files => &[FILE_PREFIX, LEGACY_FILE_PREFIX],
    }
  }
}

fn data_key(key: &str) -> String {
  format!("{}{}", DATA_PREFIX, key)
}

fn file_keys(id: i64) -> [String; 2] {
  [
    format!("{}{}", FILE_PREFIX, id),
    format!("{}{}", LEGACY_FILE_PREFIX, id),
  ]
}

enum Op {
  Get {
    keys: Vec<String>,
    reply: oneshot::Sender<Option<String>>,
  },
  Set {
    key: String,
    value: String,
  },
  Remove {
    keys: Vec<String>,
  },
  Clear {
    scope: ClearScope,
    reply: oneshot::Sender<()>,
  },
  Flush {
    reply: oneshot::Sender<()>,
  },
}

/// Handle to the persistent key-value cache. Cheap to clone.
#[derive(Clone)]
pub struct PersistentCache {
  tx: mpsc::UnboundedSender<Op>,
}

impl PersistentCache {
  /// Start the cache worker over `storage`.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn new<S: KeyValueStorage>(storage: S) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(Arc::new(storage), rx));
    Self { tx }
  }

  /// Read and decode a data entry. Missing, unreadable and undecodable
  /// entries all come back as `None`. Entries that are not JSON at all are
  /// also removed; valid JSON of another shape is left for its owner.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let storage_key = data_key(key);
    let raw = self.read(vec![storage_key.clone()]).await?;
    self.decode(&raw, vec![storage_key])
  }

  /// Encode and write a data entry, waiting until the write was attempted.
  pub async fn set<T: Serialize>(&self, key: &str, value: &T) {
    self.set_detached(key, value);
    self.flush().await;
  }

  /// Encode and queue a data entry write without waiting for it.
  pub fn set_detached<T: Serialize>(&self, key: &str, value: &T) {
    match serde_json::to_string(value) {
      Ok(encoded) => self.submit(Op::Set {
        key: data_key(key),
        value: encoded,
      }),
      Err(e) => warn!(key, "Error encoding cache value: {}", e),
    }
  }

  pub async fn remove(&self, key: &str) {
    self.submit(Op::Remove {
      keys: vec![data_key(key)],
    });
    self.flush().await;
  }

  /// Remove every entry in `scope`.
  pub async fn clear(&self, scope: ClearScope) {
    let (reply, done) = oneshot::channel();
    self.submit(Op::Clear { scope, reply });
    let _ = done.await;
  }

  /// Wait until every previously submitted operation has been applied.
  pub async fn flush(&self) {
    let (reply, done) = oneshot::channel();
    self.submit(Op::Flush { reply });
    let _ = done.await;
  }

  /// Metadata cached for a file, falling back to the legacy key.
  pub async fn get_file_meta<T: DeserializeOwned>(&self, id: i64) -> Option<T> {
    let keys = file_keys(id).to_vec();
    let raw = self.read(keys.clone()).await?;
    self.decode(&raw, keys)
  }

  pub async fn set_file_meta<T: Serialize>(&self, id: i64, meta: &T) {
    match serde_json::to_string(meta) {
      Ok(encoded) => {
        let [key, _] = file_keys(id);
        self.submit(Op::Set { key, value: encoded });
        self.flush().await;
      }
      Err(e) => warn!(file_id = id, "Error encoding file metadata: {}", e),
    }
  }

  pub async fn remove_file_meta(&self, id: i64) {
    self.submit(Op::Remove {
      keys: file_keys(id).to_vec(),
    });
    self.flush().await;
  }

  async fn read(&self, keys: Vec<String>) -> Option<String> {
    let (reply, value) = oneshot::channel();
    self.submit(Op::Get { keys, reply });
    value.await.ok().flatten()
  }

  fn decode<T: DeserializeOwned>(&self, raw: &str, keys: Vec<String>) -> Option<T> {
    let value: Value = match serde_json::from_str(raw) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = %keys[0], "Invalid cached payload, clearing entry: {}", e);
        self.submit(Op::Remove { keys });
        return None;
      }
    };

    match serde_json::from_value(value) {
      Ok(decoded) => Some(decoded),
      Err(e) => {
        warn!(key = %keys[0], "Cached payload has an unexpected shape, ignoring it: {}", e);
        None
      }
    }
  }

  fn submit(&self, op: Op) {
    if self.tx.send(op).is_err() {
      warn!("Cache worker is gone, dropping operation");
    }
  }
}

async fn run_worker<S: KeyValueStorage>(storage: Arc<S>, mut rx: mpsc::UnboundedReceiver<Op>) {
  while let Some(op) = rx.recv().await {
    let storage = Arc::clone(&storage);
    if let Err(e) = tokio::task::spawn_blocking(move || apply(storage.as_ref(), op)).await {
      error!("Cache operation panicked: {}", e);
    }
  }
  debug!("Cache worker stopped");
}

fn apply<S: KeyValueStorage>(storage: &S, op: Op) {
  match op {
    Op::Get { keys, reply } => {
      let mut found = None;
      for key in &keys {
        match storage.get_raw(key) {
          Ok(Some(value)) => {
            found = Some(value);
            break;
          }
          Ok(None) => {}
          Err(e) => {
            warn!(key = %key, "Error reading cache key: {}", e);
            break;
          }
        }
      }
      let _ = reply.send(found);
    }
    Op::Set { key, value } => {
      if let Err(e) = storage.set_raw(&key, &value) {
        warn!(key = %key, "Error writing cache key: {}", e);
      }
    }
    Op::Remove { keys } => {
      if let Err(e) = storage.remove(&keys) {
        warn!(keys = ?keys, "Error removing cache keys: {}", e);
      }
    }
    Op::Clear { scope, reply } => {
      for prefix in scope.prefixes() {
        match storage.remove_prefix(prefix) {
          Ok(removed) => debug!(scope = ?scope, prefix, removed, "Cleared cache entries"),
          Err(e) => warn!(scope = ?scope, "Error clearing cache: {}", e),
        }
      }
      let _ = reply.send(());
    }
    Op::Flush { reply } => {
      let _ = reply.send(());
    }
  }
}
