//! Cache layer that ties bindings, persistence and network refreshes together.

use color_eyre::Result;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::persistent::{ClearScope, PersistentCache};
use super::registry::ListenerRegistry;
use super::state::CachedState;
use super::storage::{KeyValueStorage, NoopStorage, SqliteStorage};
use super::traits::{CacheResult, Cacheable};

/// Cache layer that owns the persistent cache and the listener registry.
///
/// Cheap to clone; clones share the same bindings.
#[derive(Clone)]
pub struct CacheLayer {
  cache: PersistentCache,
  registry: Arc<ListenerRegistry>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn new<S: KeyValueStorage>(storage: S) -> Self {
    Self {
      cache: PersistentCache::new(storage),
      registry: ListenerRegistry::new(),
    }
  }

  /// Open a layer backed by the SQLite file at `path`, or memory only when
  /// `path` is `None`. A store that cannot be opened degrades to memory only.
  pub async fn open(path: Option<&Path>) -> Self {
    let Some(path) = path else {
      return Self::new(NoopStorage);
    };

    let path = path.to_path_buf();
    let opened = tokio::task::spawn_blocking(move || SqliteStorage::open(&path)).await;
    match opened {
      Ok(Ok(storage)) => Self::new(storage),
      Ok(Err(e)) => {
        warn!("Persistent cache unavailable, continuing in memory: {}", e);
        Self::new(NoopStorage)
      }
      Err(e) => {
        warn!("Persistent cache unavailable, continuing in memory: {}", e);
        Self::new(NoopStorage)
      }
    }
  }

  pub fn persistent(&self) -> &PersistentCache {
    &self.cache
  }

  pub fn registry(&self) -> &Arc<ListenerRegistry> {
    &self.registry
  }

  /// Bind `key` to a new observable value starting at `initial`.
  ///
  /// Hydration from the persistent cache starts immediately in the background.
  pub fn bind<T: Cacheable>(&self, key: &str, initial: T) -> CachedState<T> {
    CachedState::bind(self.clone(), key, initial)
  }

  /// Clear every data entry and reset all live bindings to their initial
  /// values. Bindings are notified even when the backend clear failed.
  pub async fn clear_all(&self) {
    self.cache.clear(ClearScope::Data).await;
    self.notify_clear(ClearScope::Data);
  }

  /// Clear cached file metadata, including entries under the legacy prefix.
  pub async fn clear_files(&self) {
    self.cache.clear(ClearScope::Files).await;
    self.notify_clear(ClearScope::Files);
  }

  fn notify_clear(&self, scope: ClearScope) {
    let _publish = self.registry.lock_publish();
    if scope == ClearScope::Data {
      self.registry.forget_all();
    }
    self.registry.broadcast_clear(scope);
  }

  /// Refresh a binding from the network.
  ///
  /// On success the fetched value is published to every binding of the key.
  /// On failure the binding keeps its value and the result is marked offline.
  pub async fn refresh<T, F, Fut>(&self, state: &CachedState<T>, fetcher: F) -> CacheResult<T>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    match fetcher().await {
      Ok(data) => {
        state.set(data.clone());
        debug!(key = state.key(), "Refreshed from network");
        CacheResult::from_network(data)
      }
      Err(e) => {
        warn!(key = state.key(), "Refresh failed, serving cached value: {}", e);
        CacheResult::offline(state.value())
      }
    }
  }
}

static SHARED: OnceCell<CacheLayer> = OnceCell::const_new();

/// Process-wide cache layer, opened on first use.
///
/// Concurrent first callers share one initialization; `path` is only
/// consulted by the call that performs it.
pub async fn shared_cache(path: Option<&Path>) -> CacheLayer {
  SHARED.get_or_init(|| CacheLayer::open(path)).await.clone()
}
