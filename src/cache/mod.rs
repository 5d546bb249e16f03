//! Offline-aware caching layer.
//!
//! This module keeps app state alive across restarts and network loss:
//! - Persists JSON values under namespaced keys in a local key-value store
//! - Binds keys to observable values that hydrate in the background
//! - Broadcasts every write to all live bindings of the same key
//! - Serves the cached value when a network refresh fails

pub mod keys;
mod layer;
mod persistent;
mod registry;
mod state;
mod storage;
mod traits;

pub use layer::{shared_cache, CacheLayer};
pub use persistent::{ClearScope, PersistentCache, DATA_PREFIX, FILE_PREFIX, LEGACY_FILE_PREFIX};
pub use registry::{ClearListener, KeyListener, ListenerId, ListenerRegistry, Subscription};
pub use state::{CachedState, Snapshot};
pub use storage::{KeyValueStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable};
