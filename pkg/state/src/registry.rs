use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::StateStore;
use crate::watch::{EventLog, EventType};
use pkg_constants::state::EVENT_LOG_CAPACITY;

/// The storage/watch backend: a state store whose every mutation is
/// recorded in a revisioned event log.
#[derive(Clone)]
pub struct Registry {
    store: StateStore,
    events: EventLog,
    /// Serializes store writes with their event so revisions follow commit order.
    write_lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self::with_capacity(store, EVENT_LOG_CAPACITY)
    }

    /// Create a registry whose event log retains `capacity` events for replay.
    pub fn with_capacity(store: StateStore, capacity: usize) -> Self {
        Self {
            store,
            events: EventLog::new(capacity),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A registry over an in-memory store.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(StateStore::in_memory().await?))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Current revision cursor.
    pub async fn revision(&self) -> u64 {
        self.events.current_seq().await
    }

    /// Store `value` under `key` and return the revision of the change.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<u64> {
        let _guard = self.write_lock.lock().await;
        self.store.put(key, &value).await?;
        let seq = self
            .events
            .emit(EventType::Put, key.to_string(), Some(value))
            .await;
        debug!("Registry put {} @{}", key, seq);
        Ok(seq)
    }

    /// Delete `key`. The emitted event carries the last stored value.
    /// Returns `None` when the key did not exist.
    pub async fn delete(&self, key: &str) -> anyhow::Result<Option<u64>> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.store.get(key).await? else {
            return Ok(None);
        };
        self.store.delete(key).await?;
        let seq = self
            .events
            .emit(EventType::Delete, key.to_string(), Some(previous))
            .await;
        debug!("Registry delete {} @{}", key, seq);
        Ok(Some(seq))
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        self.store.list_prefix(prefix).await
    }
}
