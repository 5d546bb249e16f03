//! Observable bindings of a cache key.
//!
//! A [`CachedState`] starts at its initial value, hydrates from the persistent
//! cache in the background, and converges with every other binding of the
//! same key: a write is applied locally, persisted fire-and-forget and
//! broadcast to the other bindings before `set` returns.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::layer::CacheLayer;
use super::persistent::{ClearScope, PersistentCache};
use super::registry::{ClearListener, KeyListener, ListenerId, ListenerRegistry, Subscription};
use super::traits::Cacheable;

/// What a binding currently shows.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
  pub value: T,
  /// False until the first hydration attempt (or broadcast) completed
  pub hydrated: bool,
}

struct Shared<T> {
  key: String,
  initial: T,
  sender: watch::Sender<Snapshot<T>>,
  /// Bumped on every value change
  epoch: AtomicU64,
  /// Bumped on every reset; older hydrations are discarded
  generation: AtomicU64,
  alive: AtomicBool,
}

impl<T: Cacheable> Shared<T> {
  fn apply_broadcast(&self, value: &Value) {
    match serde_json::from_value::<T>(value.clone()) {
      Ok(next) => {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sender.send_modify(|snap| {
          snap.value = next;
          snap.hydrated = true;
        });
      }
      Err(e) => warn!(key = %self.key, "Ignoring broadcast value that does not decode: {}", e),
    }
  }

  fn reset(&self) {
    self.generation.fetch_add(1, Ordering::SeqCst);
    self.epoch.fetch_add(1, Ordering::SeqCst);
    self.sender.send_modify(|snap| {
      snap.value = self.initial.clone();
      snap.hydrated = false;
    });
  }

  fn commit_hydration(&self, registry: &ListenerRegistry, started: (u64, u64), stored: Option<T>) {
    let _publish = registry.lock_publish();

    if !self.alive.load(Ordering::SeqCst) {
      debug!(key = %self.key, "Discarding hydration for unbound key");
      return;
    }

    let (generation, epoch) = started;
    if self.generation.load(Ordering::SeqCst) != generation {
      debug!(key = %self.key, "Discarding hydration started before a reset");
      return;
    }

    // A newer value arrived while reading; keep it
    let unchanged = self.epoch.load(Ordering::SeqCst) == epoch;
    // Values published this session win over what storage returned
    let loaded = match registry.latest(&self.key) {
      Some(latest) => match serde_json::from_value::<T>(latest) {
        Ok(value) => Some(value),
        Err(e) => {
          warn!(key = %self.key, "Published value does not decode, using stored value: {}", e);
          stored
        }
      },
      None => stored,
    };
    self.sender.send_modify(|snap| {
      if let (true, Some(value)) = (unchanged, loaded) {
        snap.value = value;
      }
      snap.hydrated = true;
    });
  }
}

fn spawn_hydration<T: Cacheable>(shared: Arc<Shared<T>>, cache: PersistentCache, registry: Weak<ListenerRegistry>) {
  let started = (
    shared.generation.load(Ordering::SeqCst),
    shared.epoch.load(Ordering::SeqCst),
  );

  tokio::spawn(async move {
    let stored = cache.get::<T>(&shared.key).await;
    if let Some(registry) = registry.upgrade() {
      shared.commit_hydration(&registry, started, stored);
    }
  });
}

/// One binding of a cache key to an observable value.
///
/// Created through [`CacheLayer::bind`]. Call [`CachedState::unbind`] on
/// teardown; dropping the binding has the same effect.
pub struct CachedState<T: Cacheable> {
  shared: Arc<Shared<T>>,
  layer: CacheLayer,
  listener_id: ListenerId,
  subscriptions: Option<[Subscription; 2]>,
}

impl<T: Cacheable> CachedState<T> {
  pub(super) fn bind(layer: CacheLayer, key: &str, initial: T) -> Self {
    let (sender, _) = watch::channel(Snapshot {
      value: initial.clone(),
      hydrated: false,
    });
    let shared = Arc::new(Shared {
      key: key.to_string(),
      initial,
      sender,
      epoch: AtomicU64::new(0),
      generation: AtomicU64::new(0),
      alive: AtomicBool::new(true),
    });

    let registry = layer.registry();

    let on_value: KeyListener = {
      let shared = Arc::clone(&shared);
      Arc::new(move |value: &Value| shared.apply_broadcast(value))
    };
    let value_subscription = registry.subscribe_key(key, on_value);

    let on_clear: ClearListener = {
      let shared = Arc::clone(&shared);
      let cache = layer.persistent().clone();
      let registry = Arc::downgrade(registry);
      Arc::new(move || {
        shared.reset();
        spawn_hydration(Arc::clone(&shared), cache.clone(), registry.clone());
      })
    };
    let clear_subscription = registry.subscribe_clear(ClearScope::Data, on_clear);

    spawn_hydration(
      Arc::clone(&shared),
      layer.persistent().clone(),
      Arc::downgrade(registry),
    );

    Self {
      shared,
      listener_id: value_subscription.id(),
      subscriptions: Some([value_subscription, clear_subscription]),
      layer,
    }
  }

  pub fn key(&self) -> &str {
    &self.shared.key
  }

  /// Current value (a copy).
  pub fn value(&self) -> T {
    self.shared.sender.borrow().value.clone()
  }

  pub fn is_hydrated(&self) -> bool {
    self.shared.sender.borrow().hydrated
  }

  pub fn snapshot(&self) -> Snapshot<T> {
    self.shared.sender.borrow().clone()
  }

  /// Receiver notified on every change of this binding.
  pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
    self.shared.sender.subscribe()
  }

  /// Resolve once the binding has hydrated.
  pub async fn wait_hydrated(&self) {
    let mut rx = self.shared.sender.subscribe();
    let _ = rx.wait_for(|snap| snap.hydrated).await;
  }

  /// Replace the value.
  pub fn set(&self, value: T) {
    self.update(move |_| value);
  }

  /// Derive the next value from the current one.
  ///
  /// Calls are applied in order, each on top of the previous result. The new
  /// value reaches every other binding of the key before this returns;
  /// persistence happens in the background.
  ///
  /// `f` runs while the layer's publish lock is held. It may read any binding
  /// but must not write one.
  pub fn update(&self, f: impl FnOnce(&T) -> T) {
    let registry = self.layer.registry();
    let _publish = registry.lock_publish();

    let current = self.value();
    let next = f(&current);
    self.shared.sender.send_modify(|snap| snap.value = next.clone());
    self.shared.epoch.fetch_add(1, Ordering::SeqCst);

    match serde_json::to_value(&next) {
      Ok(encoded) => {
        registry.remember(&self.shared.key, &encoded);
        self.layer.persistent().set_detached(&self.shared.key, &encoded);
        registry.broadcast(&self.shared.key, &encoded, Some(self.listener_id));
      }
      Err(e) => {
        warn!(key = %self.shared.key, "Value cannot be encoded, keeping it in memory only: {}", e);
      }
    }
  }

  /// Detach from the registry. Pending hydrations are discarded.
  pub fn unbind(mut self) {
    self.teardown();
  }

  fn teardown(&mut self) {
    self.shared.alive.store(false, Ordering::SeqCst);
    if let Some(subscriptions) = self.subscriptions.take() {
      for subscription in subscriptions {
        subscription.unsubscribe();
      }
    }
  }
}

impl<T: Cacheable> Drop for CachedState<T> {
  fn drop(&mut self) {
    self.teardown();
  }
}

impl<T: Cacheable + std::fmt::Debug> std::fmt::Debug for CachedState<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedState")
      .field("key", &self.shared.key)
      .field("snapshot", &*self.shared.sender.borrow())
      .finish_non_exhaustive()
  }
}
