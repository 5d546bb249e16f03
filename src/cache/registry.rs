//! Pub/sub registry connecting every live binding of a cache key.
//!
//! Listeners are called synchronously, in subscription order, while the
//! registry lock is held. They must not subscribe, unsubscribe or publish
//! from inside the callback.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use super::persistent::ClearScope;

/// Called with the new value whenever another binding writes the key
pub type KeyListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Called when a whole cache scope is cleared
pub type ClearListener = Arc<dyn Fn() + Send + Sync>;

/// Identifies one subscription inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
  by_key: HashMap<String, Vec<(ListenerId, KeyListener)>>,
  on_clear: HashMap<ClearScope, Vec<(ListenerId, ClearListener)>>,
}

#[derive(Default)]
pub struct ListenerRegistry {
  next_id: AtomicU64,
  listeners: Mutex<Listeners>,
  /// Last value published per key during this session
  latest: Mutex<HashMap<String, Value>>,
  /// Serializes value changes so every binding sees them in the same order
  publish: Mutex<()>,
}

impl ListenerRegistry {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn allocate_id(&self) -> ListenerId {
    ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
  }

  fn listeners(&self) -> MutexGuard<'_, Listeners> {
    // Listener maps stay consistent even if a callback panicked
    self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn latest_values(&self) -> MutexGuard<'_, HashMap<String, Value>> {
    self.latest.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record `value` as the current value of `key`. Call under the publish lock.
  pub fn remember(&self, key: &str, value: &Value) {
    self.latest_values().insert(key.to_string(), value.clone());
  }

  /// Value last published on `key`, if any since the last data clear.
  pub fn latest(&self, key: &str) -> Option<Value> {
    self.latest_values().get(key).cloned()
  }

  /// Drop every remembered value. Call under the publish lock.
  pub fn forget_all(&self) {
    self.latest_values().clear();
  }

  /// Hold while changing a bound value and broadcasting it.
  pub fn lock_publish(&self) -> MutexGuard<'_, ()> {
    self.publish.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Listen for values published on `key`.
  pub fn subscribe_key(self: &Arc<Self>, key: &str, listener: KeyListener) -> Subscription {
    let id = self.allocate_id();
    self
      .listeners()
      .by_key
      .entry(key.to_string())
      .or_default()
      .push((id, listener));
    Subscription {
      registry: Arc::downgrade(self),
      id,
      target: Target::Key(key.to_string()),
    }
  }

  /// Listen for clears of `scope`.
  pub fn subscribe_clear(self: &Arc<Self>, scope: ClearScope, listener: ClearListener) -> Subscription {
    let id = self.allocate_id();
    self
      .listeners()
      .on_clear
      .entry(scope)
      .or_default()
      .push((id, listener));
    Subscription {
      registry: Arc::downgrade(self),
      id,
      target: Target::Clear(scope),
    }
  }

  /// Deliver `value` to every listener of `key` except `origin`.
  pub fn broadcast(&self, key: &str, value: &Value, origin: Option<ListenerId>) {
    let listeners = self.listeners();
    let Some(subscribers) = listeners.by_key.get(key) else {
      return;
    };
    for (id, listener) in subscribers {
      if Some(*id) != origin {
        listener(value);
      }
    }
  }

  /// Notify every clear listener of `scope`.
  pub fn broadcast_clear(&self, scope: ClearScope) {
    let listeners = self.listeners();
    let count = listeners.on_clear.get(&scope).map_or(0, |subscribers| {
      for (_, listener) in subscribers {
        listener();
      }
      subscribers.len()
    });
    debug!(scope = ?scope, listeners = count, "Broadcast cache clear");
  }

  /// Number of live listeners on `key`.
  pub fn subscriber_count(&self, key: &str) -> usize {
    self.listeners().by_key.get(key).map_or(0, Vec::len)
  }

  fn remove(&self, id: ListenerId, target: &Target) {
    let mut listeners = self.listeners();
    match target {
      Target::Key(key) => {
        if let Some(subscribers) = listeners.by_key.get_mut(key) {
          subscribers.retain(|(existing, _)| *existing != id);
          if subscribers.is_empty() {
            listeners.by_key.remove(key);
          }
        }
      }
      Target::Clear(scope) => {
        if let Some(subscribers) = listeners.on_clear.get_mut(scope) {
          subscribers.retain(|(existing, _)| *existing != id);
        }
      }
    }
  }
}

#[derive(Debug)]
enum Target {
  Key(String),
  Clear(ClearScope),
}

/// Disposer returned by the subscribe calls.
///
/// Dropping it does nothing; call `unsubscribe` on teardown.
#[derive(Debug)]
#[must_use = "listeners stay registered until `unsubscribe` is called"]
pub struct Subscription {
  registry: Weak<ListenerRegistry>,
  id: ListenerId,
  target: Target,
}

impl Subscription {
  pub fn id(&self) -> ListenerId {
    self.id
  }

  pub fn unsubscribe(self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.remove(self.id, &self.target);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn recorder() -> (Arc<Mutex<Vec<Value>>>, KeyListener) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: KeyListener = Arc::new(move |value: &Value| sink.lock().unwrap().push(value.clone()));
    (seen, listener)
  }

  #[test]
  fn test_broadcast_reaches_all_but_origin() {
    let registry = ListenerRegistry::new();
    let (seen_a, listener_a) = recorder();
    let (seen_b, listener_b) = recorder();
    let a = registry.subscribe_key("accounts", listener_a);
    let _b = registry.subscribe_key("accounts", listener_b);

    registry.broadcast("accounts", &json!([1]), Some(a.id()));
    registry.broadcast("other", &json!([2]), None);

    assert!(seen_a.lock().unwrap().is_empty());
    assert_eq!(*seen_b.lock().unwrap(), vec![json!([1])]);
  }

  #[test]
  fn test_unsubscribe_removes_listener() {
    let registry = ListenerRegistry::new();
    let (seen, listener) = recorder();
    let subscription = registry.subscribe_key("ledger", listener);
    assert_eq!(registry.subscriber_count("ledger"), 1);

    subscription.unsubscribe();
    registry.broadcast("ledger", &json!(1), None);

    assert_eq!(registry.subscriber_count("ledger"), 0);
    assert!(seen.lock().unwrap().is_empty());
  }

  #[test]
  fn test_latest_value_is_remembered_until_forgotten() {
    let registry = ListenerRegistry::new();
    assert_eq!(registry.latest("jobs"), None);

    registry.remember("jobs", &json!(1));
    registry.remember("jobs", &json!(2));
    assert_eq!(registry.latest("jobs"), Some(json!(2)));

    registry.forget_all();
    assert_eq!(registry.latest("jobs"), None);
  }

  #[test]
  fn test_clear_listeners_are_scoped() {
    let registry = ListenerRegistry::new();
    let hits = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&hits);
    let subscription = registry.subscribe_clear(
      ClearScope::Data,
      Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
      }),
    );

    registry.broadcast_clear(ClearScope::Files);
    registry.broadcast_clear(ClearScope::Data);
    subscription.unsubscribe();
    registry.broadcast_clear(ClearScope::Data);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }
}
