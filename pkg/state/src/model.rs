use std::marker::PhantomData;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::registry::Registry;
use crate::watch::{EventType, WatchEvent};
use pkg_types::deployment::Deployment;
use pkg_types::endpoint::EndpointManifest;
use pkg_types::entity::{Entity, Owned, collection_prefix, namespace_prefix, owner_prefix};
use pkg_types::namespace::Namespace;
use pkg_types::node::Node;
use pkg_types::pod::Pod;
use pkg_types::service::Service;
use pkg_types::validate::validate_entity;

pub type NamespaceModel = Model<Namespace>;
pub type NodeModel = Model<Node>;
pub type ServiceModel = Model<Service>;
pub type DeploymentModel = Model<Deployment>;
pub type PodModel = Model<Pod>;
pub type EndpointModel = Model<EndpointManifest>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Created or updated.
    Set,
    Remove,
}

/// A typed change event for one entity kind.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub revision: u64,
    pub action: Action,
    /// `None` when the stored value could not be recovered.
    pub data: Option<T>,
}

impl<T> Event<T> {
    pub fn is_remove(&self) -> bool {
        self.action == Action::Remove
    }
}

/// Watch resume point of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Runtime {
    pub revision: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch history compacted: requested revision {requested}, oldest retained {oldest}")]
    Compacted { requested: u64, oldest: u64 },
    #[error("event log closed")]
    Closed,
}

/// Typed accessor for one entity collection.
pub struct Model<T> {
    registry: Registry,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for Model<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            _kind: PhantomData,
        }
    }
}

impl<T: Entity> Model<T> {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            _kind: PhantomData,
        }
    }

    /// Snapshot of the whole collection.
    pub async fn list(&self) -> anyhow::Result<Vec<T>> {
        self.list_prefix(&collection_prefix(T::COLLECTION)).await
    }

    /// Snapshot of the collection within one namespace.
    pub async fn list_in(&self, namespace: &str) -> anyhow::Result<Vec<T>> {
        self.list_prefix(&namespace_prefix(T::COLLECTION, namespace))
            .await
    }

    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        let entries = self.registry.list_prefix(prefix).await?;
        let mut items = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<T>(&value) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping undecodable {} entry {}: {}", T::COLLECTION, key, e),
            }
        }
        Ok(items)
    }

    /// Fetch one entity by storage key.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.registry.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Create or replace an entity. Returns the revision of the change.
    pub async fn put(&self, entity: &T) -> anyhow::Result<u64> {
        validate_entity(entity)?;
        let value = serde_json::to_vec(entity)?;
        self.registry.put(&entity.key(), value).await
    }

    /// Remove an entity. Returns `None` if it was not stored.
    pub async fn delete(&self, entity: &T) -> anyhow::Result<Option<u64>> {
        self.registry.delete(&entity.key()).await
    }

    /// Current revision cursor of the backend.
    pub async fn runtime(&self) -> Runtime {
        Runtime {
            revision: self.registry.revision().await,
        }
    }

    /// Push typed events for this collection committed strictly after
    /// `from_revision` into `tx`, until `cancel` fires or `tx` is closed.
    ///
    /// Buffered history is replayed first, then live events follow. If the
    /// live stream lags, the watch resubscribes and replays from the last
    /// delivered revision after a backoff.
    pub async fn watch(
        &self,
        tx: mpsc::Sender<Event<T>>,
        from_revision: u64,
        cancel: CancellationToken,
    ) -> Result<(), WatchError> {
        let prefix = collection_prefix(T::COLLECTION);
        let events = self.registry.events();
        let mut last = from_revision;
        let mut backoff = Backoff::default();

        loop {
            // Subscribe before replaying so nothing committed in between is missed.
            let mut rx = events.subscribe();
            let replay = events.events_since(last).await.map_err(|c| {
                WatchError::Compacted {
                    requested: c.requested,
                    oldest: c.oldest,
                }
            })?;

            for event in replay {
                if !self.forward(&tx, &prefix, event, &mut last, &cancel).await {
                    return Ok(());
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if !self.forward(&tx, &prefix, event, &mut last, &cancel).await {
                                return Ok(());
                            }
                            backoff.reset();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                "{} watch lagged by {} events, resuming from revision {}",
                                T::COLLECTION, skipped, last
                            );
                            break;
                        }
                        Err(RecvError::Closed) => return Err(WatchError::Closed),
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    /// Like [`Model::watch`], but never gives up: a failed watch is restarted
    /// after a backoff, and when the history needed to resume has been
    /// compacted the collection is re-listed and every item is delivered as
    /// a `Set` event before following again from the listing revision.
    /// Removals that fall inside a compacted gap are not recovered.
    ///
    /// Returns once `cancel` fires or `tx` is closed.
    pub async fn follow(
        &self,
        tx: mpsc::Sender<Event<T>>,
        from_revision: u64,
        cancel: CancellationToken,
    ) {
        let mut from = from_revision;
        let mut backoff = Backoff::default();
        loop {
            let err = match self.watch(tx.clone(), from, cancel.clone()).await {
                Ok(()) => return,
                Err(e) => e,
            };
            warn!("Watch on {} failed: {}", T::COLLECTION, err);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }

            if let WatchError::Compacted { .. } = err {
                from = self.runtime().await.revision;
                match self.list().await {
                    Ok(items) => {
                        info!(
                            "{} re-listed at revision {}: {} items",
                            T::COLLECTION,
                            from,
                            items.len()
                        );
                        for item in items {
                            let event = Event {
                                revision: from,
                                action: Action::Set,
                                data: Some(item),
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Failed to re-list {}: {}", T::COLLECTION, e),
                }
            }
        }
    }

    /// Decode and deliver one raw event. Returns `false` once delivery is
    /// no longer possible (receiver gone or cancelled).
    async fn forward(
        &self,
        tx: &mpsc::Sender<Event<T>>,
        prefix: &str,
        event: WatchEvent,
        last: &mut u64,
        cancel: &CancellationToken,
    ) -> bool {
        if event.seq <= *last {
            return true;
        }
        *last = event.seq;

        if !event.key.starts_with(prefix) {
            return true;
        }

        let action = match event.event_type {
            EventType::Put => Action::Set,
            EventType::Delete => Action::Remove,
        };
        let data = event
            .value
            .as_deref()
            .and_then(|raw| match serde_json::from_slice::<T>(raw) {
                Ok(item) => Some(item),
                Err(e) => {
                    debug!("Undecodable {} event {}: {}", T::COLLECTION, event.key, e);
                    None
                }
            });

        let typed = Event {
            revision: event.seq,
            action,
            data,
        };

        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = tx.send(typed) => sent.is_ok(),
        }
    }
}

impl<T: Owned> Model<T> {
    /// Snapshot of the entities owned by service `service` in `namespace`.
    /// Owned keys nest the service name, so this is a single prefix scan.
    pub async fn list_owned(&self, namespace: &str, service: &str) -> anyhow::Result<Vec<T>> {
        self.list_prefix(&owner_prefix(T::COLLECTION, &[namespace, service]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StateStore;
    use std::time::Duration;

    async fn recv<T>(rx: &mut mpsc::Receiver<Event<T>>) -> Event<T> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("watch channel closed")
    }

    #[tokio::test]
    async fn list_is_scoped_by_collection_and_namespace() {
        let registry = Registry::in_memory().await.unwrap();
        let services = ServiceModel::new(registry.clone());
        let deployments = DeploymentModel::new(registry.clone());

        services.put(&Service::new("default", "web")).await.unwrap();
        services.put(&Service::new("default", "db")).await.unwrap();
        services.put(&Service::new("other", "web")).await.unwrap();
        deployments
            .put(&Deployment::new("default", "web", "api"))
            .await
            .unwrap();

        assert_eq!(services.list().await.unwrap().len(), 3);
        assert_eq!(services.list_in("default").await.unwrap().len(), 2);
        assert_eq!(deployments.list_in("default").await.unwrap().len(), 1);
        assert!(deployments.list_in("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_owned_scans_one_service() {
        let registry = Registry::in_memory().await.unwrap();
        let deployments = DeploymentModel::new(registry.clone());
        let pods = PodModel::new(registry.clone());

        for (service, name) in [("web", "api"), ("web", "worker"), ("web-2", "api"), ("db", "pg")] {
            deployments
                .put(&Deployment::new("default", service, name))
                .await
                .unwrap();
        }
        deployments
            .put(&Deployment::new("other", "web", "api"))
            .await
            .unwrap();
        pods.put(&Pod::new("default", "web", "api", "api-0"))
            .await
            .unwrap();
        pods.put(&Pod::new("default", "web-2", "api", "api-0"))
            .await
            .unwrap();

        let mut owned: Vec<String> = deployments
            .list_owned("default", "web")
            .await
            .unwrap()
            .iter()
            .map(|d| d.self_link())
            .collect();
        owned.sort();
        assert_eq!(owned, vec!["default:web:api", "default:web:worker"]);

        let pods = pods.list_owned("default", "web").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].self_link(), "default:web:api:api-0");
        assert!(deployments.list_owned("default", "cache").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_rejects_invalid_names() {
        let registry = Registry::in_memory().await.unwrap();
        let services = ServiceModel::new(registry);
        assert!(services.put(&Service::new("default", "Web")).await.is_err());
    }

    #[tokio::test]
    async fn watch_resumes_strictly_after_revision() {
        let registry = Registry::in_memory().await.unwrap();
        let services = ServiceModel::new(registry.clone());
        let pods = PodModel::new(registry.clone());

        services.put(&Service::new("default", "old")).await.unwrap();
        let from = services.runtime().await.revision;
        services.put(&Service::new("default", "web")).await.unwrap();
        pods.put(&Pod::new("default", "web", "api", "api-0"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watcher = services.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { watcher.watch(tx, from, token).await });

        let first = recv(&mut rx).await;
        assert_eq!(first.action, Action::Set);
        assert_eq!(first.data.unwrap().name, "web");

        // Live event after replay; pod events are filtered out
        let web = Service::new("default", "web");
        services.delete(&web).await.unwrap();
        let removed = recv(&mut rx).await;
        assert!(removed.is_remove());
        assert_eq!(removed.data.unwrap().name, "web");

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn watch_reports_compacted_history() {
        let registry = Registry::with_capacity(StateStore::in_memory().await.unwrap(), 2);
        let services = ServiceModel::new(registry);
        for name in ["a", "b", "c", "d"] {
            services.put(&Service::new("default", name)).await.unwrap();
        }

        let (tx, _rx) = mpsc::channel(16);
        let err = services
            .watch(tx, 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Compacted { requested: 0, oldest: 3 }));
    }

    #[tokio::test]
    async fn follow_relists_after_compaction() {
        let registry = Registry::with_capacity(StateStore::in_memory().await.unwrap(), 2);
        let services = ServiceModel::new(registry);
        for name in ["a", "b", "c", "d"] {
            services.put(&Service::new("default", name)).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let follower = services.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { follower.follow(tx, 0, token).await });

        let mut names = Vec::new();
        for _ in 0..4 {
            let event = recv(&mut rx).await;
            assert_eq!(event.action, Action::Set);
            assert_eq!(event.revision, 4);
            names.push(event.data.unwrap().name);
        }
        assert_eq!(names, vec!["a", "b", "c", "d"]);

        services.put(&Service::new("default", "e")).await.unwrap();
        assert_eq!(recv(&mut rx).await.data.unwrap().name, "e");

        cancel.cancel();
        task.await.unwrap();
    }
}
