use pkg_constants::state::{PENDING_PER_OWNER_LIMIT, PENDING_RETENTION_SECS};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Events waiting for their owning service to be observed, keyed by the
/// owner's self-link. Bounded by a retention window and a per-owner limit;
/// anything beyond either bound is dropped.
#[derive(Debug)]
pub struct PendingEvents<E> {
    by_owner: HashMap<String, VecDeque<(Instant, E)>>,
    retention: Duration,
    limit: usize,
}

impl<E> PendingEvents<E> {
    pub fn new(retention: Duration, limit: usize) -> Self {
        Self {
            by_owner: HashMap::new(),
            retention,
            limit,
        }
    }

    /// Buffer `event` for `owner`, evicting that owner's oldest event when full.
    pub fn push(&mut self, owner: &str, event: E, now: Instant) {
        let queue = self.by_owner.entry(owner.to_string()).or_default();
        queue.push_back((now, event));
        if queue.len() > self.limit {
            queue.pop_front();
            debug!("Pending events for {} over limit, dropped oldest", owner);
        }
    }

    /// Remove and return the unexpired events of `owner`, oldest first.
    pub fn take(&mut self, owner: &str, now: Instant) -> Vec<E> {
        let retention = self.retention;
        self.by_owner
            .remove(owner)
            .map(|queue| {
                queue
                    .into_iter()
                    .filter(|(at, _)| now.saturating_duration_since(*at) < retention)
                    .map(|(_, event)| event)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget everything buffered for `owner`.
    pub fn discard(&mut self, owner: &str) {
        if let Some(queue) = self.by_owner.remove(owner) {
            debug!("Discarded {} pending events for {}", queue.len(), owner);
        }
    }

    /// Drop events older than the retention window.
    pub fn prune(&mut self, now: Instant) {
        let retention = self.retention;
        self.by_owner.retain(|owner, queue| {
            let before = queue.len();
            queue.retain(|(at, _)| now.saturating_duration_since(*at) < retention);
            if queue.len() < before {
                debug!(
                    "Expired {} pending events for {}",
                    before - queue.len(),
                    owner
                );
            }
            !queue.is_empty()
        });
    }

    /// Total buffered events.
    pub fn len(&self) -> usize {
        self.by_owner.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }
}

impl<E> Default for PendingEvents<E> {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(PENDING_RETENTION_SECS),
            PENDING_PER_OWNER_LIMIT,
        )
    }
}
