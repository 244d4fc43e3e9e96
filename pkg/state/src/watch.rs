use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use pkg_constants::state::WATCH_BROADCAST_CAPACITY;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Delete,
}

/// A single state change. `seq` is the revision the change was committed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    /// New value for a put, last value for a delete.
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// Replay was requested from a revision that has already been evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compacted {
    pub requested: u64,
    pub oldest: u64,
}

/// In-memory event log that tracks all state mutations with monotonic sequence numbers.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<WatchEvent>,
}

struct EventLogInner {
    seq: u64,
    /// Ring buffer of recent events
    events: VecDeque<WatchEvent>,
    max_events: usize,
}

impl EventLog {
    /// Create a new event log keeping the `max_events` most recent events for replay.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(WATCH_BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record a new event and return its sequence number.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) -> u64 {
        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let event = WatchEvent {
            seq: inner.seq,
            event_type,
            key,
            value,
        };
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // No receivers is fine
        let _ = self.sender.send(event);
        inner.seq
    }

    /// Get the current sequence number.
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Get all events committed strictly after `from_seq`.
    pub async fn events_since(&self, from_seq: u64) -> Result<Vec<WatchEvent>, Compacted> {
        let inner = self.inner.read().await;
        let oldest = inner
            .events
            .front()
            .map(|e| e.seq)
            .unwrap_or(inner.seq + 1);

        if from_seq + 1 < oldest {
            return Err(Compacted {
                requested: from_seq,
                oldest,
            });
        }

        Ok(inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect())
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}
