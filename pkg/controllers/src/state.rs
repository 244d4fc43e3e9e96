use pkg_constants::state::WATCH_CHANNEL_CAPACITY;
use pkg_state::{
    Action, DeploymentModel, Event, Model, NamespaceModel, NodeModel, PodModel, Registry,
    ServiceModel,
};
use pkg_types::deployment::Deployment;
use pkg_types::pod::Pod;
use pkg_types::service::Service;
use pkg_types::{Entity, Owned};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::cluster::ClusterState;
use crate::pending::PendingEvents;
use crate::service::ServiceState;

/// A watch event for one of the reconciled collections.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Service(Event<Service>),
    Deployment(Event<Deployment>),
    Pod(Event<Pod>),
}

/// A deployment or pod change, resolved to its owner.
#[derive(Debug, Clone)]
enum OwnedChange {
    Deployment(Action, Deployment),
    Pod(Action, Pod),
}

impl OwnedChange {
    fn owner(&self) -> String {
        match self {
            OwnedChange::Deployment(_, d) => d.service_link(),
            OwnedChange::Pod(_, p) => p.service_link(),
        }
    }

    fn apply_to(self, state: &mut ServiceState) {
        match self {
            OwnedChange::Deployment(Action::Set, d) => {
                state.set_deployment(d);
            }
            OwnedChange::Deployment(Action::Remove, d) => {
                state.del_deployment(&d);
            }
            OwnedChange::Pod(Action::Set, p) => {
                state.set_pod(p);
            }
            OwnedChange::Pod(Action::Remove, p) => {
                state.del_pod(&p);
            }
        }
    }
}

/// The service-topology map and the rules for applying events to it.
///
/// Only service events create or remove entries. Deployment and pod events
/// whose service is not tracked yet wait in a bounded buffer and are
/// replayed, in arrival order, once that service shows up.
pub struct Topology {
    cluster: Arc<ClusterState>,
    services: HashMap<String, ServiceState>,
    pending: PendingEvents<OwnedChange>,
}

impl Topology {
    pub fn new(cluster: Arc<ClusterState>) -> Self {
        Self {
            cluster,
            services: HashMap::new(),
            pending: PendingEvents::default(),
        }
    }

    /// Use a custom retention window and per-service limit for out-of-order events.
    pub fn with_pending_bounds(cluster: Arc<ClusterState>, retention: Duration, limit: usize) -> Self {
        Self {
            cluster,
            services: HashMap::new(),
            pending: PendingEvents::new(retention, limit),
        }
    }

    pub fn cluster(&self) -> Arc<ClusterState> {
        self.cluster.clone()
    }

    /// Track a restored service, replacing any previous state for its link.
    pub fn insert(&mut self, state: ServiceState) {
        self.services.insert(state.link().to_string(), state);
    }

    pub fn apply(&mut self, event: StateEvent, now: Instant) {
        self.pending.prune(now);

        match event {
            StateEvent::Service(event) => self.apply_service(event, now),
            StateEvent::Deployment(Event {
                action,
                data: Some(deployment),
                ..
            }) => self.apply_owned(OwnedChange::Deployment(action, deployment), now),
            StateEvent::Pod(Event {
                action,
                data: Some(pod),
                ..
            }) => self.apply_owned(OwnedChange::Pod(action, pod), now),
            // Nothing to resolve an owner from
            StateEvent::Deployment(_) | StateEvent::Pod(_) => {}
        }
    }

    fn apply_service(&mut self, event: Event<Service>, now: Instant) {
        let Some(service) = event.data else {
            return;
        };
        let link = service.self_link();

        if event.action == Action::Remove {
            if self.services.remove(&link).is_some() {
                debug!("Service {} removed", link);
            }
            self.pending.discard(&link);
            return;
        }

        let cluster = &self.cluster;
        let state = self.services.entry(link.clone()).or_insert_with(|| {
            debug!("Service {} tracked", link);
            ServiceState::new(cluster.clone(), service.clone())
        });
        state.set_service(service);

        for change in self.pending.take(&link, now) {
            change.apply_to(state);
        }
    }

    fn apply_owned(&mut self, change: OwnedChange, now: Instant) {
        let owner = change.owner();
        match self.services.get_mut(&owner) {
            Some(state) => change.apply_to(state),
            None => {
                debug!("Service {} not tracked yet, buffering event", owner);
                self.pending.push(&owner, change, now);
            }
        }
    }

    pub fn service(&self, link: &str) -> Option<&ServiceState> {
        self.services.get(link)
    }

    /// Tracked service links, sorted.
    pub fn links(&self) -> Vec<String> {
        let mut links: Vec<String> = self.services.keys().cloned().collect();
        links.sort();
        links
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Number of buffered out-of-order events.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

enum Message {
    Apply(StateEvent),
    Service(String, oneshot::Sender<Option<ServiceState>>),
    Services(oneshot::Sender<Vec<String>>),
    Pending(oneshot::Sender<usize>),
}

/// Query and feed handle for the running topology actor.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<Message>,
}

impl StateHandle {
    /// Snapshot of one service's state.
    pub async fn service(&self, link: &str) -> anyhow::Result<Option<ServiceState>> {
        self.ask(|reply| Message::Service(link.to_string(), reply))
            .await
    }

    /// Links of all tracked services, sorted.
    pub async fn services(&self) -> anyhow::Result<Vec<String>> {
        self.ask(Message::Services).await
    }

    /// Number of buffered out-of-order events.
    pub async fn pending(&self) -> anyhow::Result<usize> {
        self.ask(Message::Pending).await
    }

    /// Apply an event as if it came from a watch.
    pub async fn apply(&self, event: StateEvent) -> anyhow::Result<()> {
        self.tx
            .send(Message::Apply(event))
            .await
            .map_err(|_| anyhow::anyhow!("state reconciler is not running"))
    }

    async fn ask<R>(&self, message: impl FnOnce(oneshot::Sender<R>) -> Message) -> anyhow::Result<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .await
            .map_err(|_| anyhow::anyhow!("state reconciler is not running"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("state reconciler stopped before replying"))
    }
}

/// Background tasks started by a successful restore.
pub struct RunningState {
    handle: StateHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningState {
    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    /// Stop the watch loops and the actor and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("State task ended abnormally: {}", e);
            }
        }
    }
}

/// Restores the cluster topology and keeps it in sync with the registry.
pub struct Reconciler {
    namespaces: NamespaceModel,
    nodes: NodeModel,
    services: ServiceModel,
    deployments: DeploymentModel,
    pods: PodModel,
    span: Span,
}

impl Reconciler {
    pub fn new(registry: Registry) -> Self {
        Self {
            namespaces: NamespaceModel::new(registry.clone()),
            nodes: NodeModel::new(registry.clone()),
            services: ServiceModel::new(registry.clone()),
            deployments: DeploymentModel::new(registry.clone()),
            pods: PodModel::new(registry),
            span: info_span!("state"),
        }
    }

    /// Log under `span` instead of the default `state` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Restore cluster and service state, then start the service,
    /// deployment and pod watch loops and the actor that owns the map.
    ///
    /// Any listing or restore failure aborts the whole restore; nothing
    /// is started in that case.
    pub async fn restore(&self, cancel: CancellationToken) -> anyhow::Result<RunningState> {
        self.restore_topology(cancel.child_token())
            .instrument(self.span.clone())
            .await
            .inspect_err(|e| error!(parent: &self.span, "Reconciler restore failed: {:#}", e))
    }

    async fn restore_topology(&self, cancel: CancellationToken) -> anyhow::Result<RunningState> {
        info!("Reconciler: cluster restore started");
        let mut cluster = ClusterState::new();
        cluster.restore(&self.nodes).await?;
        info!("Reconciler: cluster restore finished");

        info!("Reconciler: services restore started");
        // Cursors are taken before listing: changes committed during the
        // listing are replayed to the idempotent setters instead of lost.
        let service_rev = self.services.runtime().await.revision;
        let deployment_rev = self.deployments.runtime().await.revision;
        let pod_rev = self.pods.runtime().await.revision;

        let mut topology = Topology::new(Arc::new(cluster));
        for namespace in self.namespaces.list().await? {
            debug!("Restore services in namespace {}", namespace.name);
            for service in self.services.list_in(&namespace.name).await? {
                debug!("Restore service state {}", service.self_link());
                let mut state = ServiceState::new(topology.cluster(), service);
                state.restore(&self.deployments, &self.pods).await?;
                topology.insert(state);
            }
        }
        let restored = topology.len();

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let span = Span::current();
        let tasks = vec![
            tokio::spawn(run_actor(topology, rx, cancel.clone()).instrument(span.clone())),
            tokio::spawn(
                watch_collection(
                    self.services.clone(),
                    service_rev,
                    tx.clone(),
                    StateEvent::Service,
                    cancel.clone(),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                watch_collection(
                    self.deployments.clone(),
                    deployment_rev,
                    tx.clone(),
                    StateEvent::Deployment,
                    cancel.clone(),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                watch_collection(
                    self.pods.clone(),
                    pod_rev,
                    tx.clone(),
                    StateEvent::Pod,
                    cancel.clone(),
                )
                .instrument(span),
            ),
        ];

        info!("Reconciler: services restore finished ({} services)", restored);

        Ok(RunningState {
            handle: StateHandle { tx },
            cancel,
            tasks,
        })
    }
}

/// Sole owner of the topology. Applies events and answers queries one at a time.
async fn run_actor(
    mut topology: Topology,
    mut inbox: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = inbox.recv() => match message {
                Some(Message::Apply(event)) => topology.apply(event, Instant::now()),
                Some(Message::Service(link, reply)) => {
                    let _ = reply.send(topology.service(&link).cloned());
                }
                Some(Message::Services(reply)) => {
                    let _ = reply.send(topology.links());
                }
                Some(Message::Pending(reply)) => {
                    let _ = reply.send(topology.pending());
                }
                None => break,
            }
        }
    }
    info!("Reconciler stopped ({} services tracked)", topology.len());
}

/// Consume one collection's watch and forward its events to the actor
/// until cancelled.
async fn watch_collection<T: Entity>(
    model: Model<T>,
    from_revision: u64,
    out: mpsc::Sender<Message>,
    wrap: fn(Event<T>) -> StateEvent,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<Event<T>>(WATCH_CHANNEL_CAPACITY);

    let consumer = async {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                event = rx.recv() => {
                    let Some(event) = event else { return };
                    if out.send(Message::Apply(wrap(event))).await.is_err() {
                        return;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = model.follow(tx, from_revision, cancel.clone()) => {}
        _ = consumer => {}
    }
    debug!("{} watch stopped", T::COLLECTION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::namespace::Namespace;
    use pkg_types::pod::PodStatus;

    fn set<T>(data: T) -> Event<T> {
        Event {
            revision: 0,
            action: Action::Set,
            data: Some(data),
        }
    }

    fn remove<T>(data: T) -> Event<T> {
        Event {
            revision: 0,
            action: Action::Remove,
            data: Some(data),
        }
    }

    fn topology() -> Topology {
        Topology::new(Arc::new(ClusterState::new()))
    }

    #[test]
    fn ordered_events_build_membership() {
        let mut topo = topology();
        let now = Instant::now();

        topo.apply(StateEvent::Service(set(Service::new("default", "web"))), now);
        topo.apply(StateEvent::Service(set(Service::new("default", "db"))), now);
        topo.apply(
            StateEvent::Deployment(set(Deployment::new("default", "web", "api"))),
            now,
        );
        topo.apply(
            StateEvent::Deployment(set(Deployment::new("default", "db", "pg"))),
            now,
        );
        for name in ["api-0", "api-1"] {
            topo.apply(
                StateEvent::Pod(set(Pod::new("default", "web", "api", name))),
                now,
            );
        }
        topo.apply(
            StateEvent::Pod(set(Pod::new("default", "db", "pg", "pg-0"))),
            now,
        );

        let web = topo.service("default:web").unwrap();
        let deployments: Vec<String> = web.deployments().map(|d| d.self_link()).collect();
        let pods: Vec<String> = web.pods().map(|p| p.self_link()).collect();
        assert_eq!(deployments, vec!["default:web:api"]);
        assert_eq!(pods, vec!["default:web:api:api-0", "default:web:api:api-1"]);
        assert_eq!(topo.service("default:db").unwrap().pods().count(), 1);
    }

    #[test]
    fn service_update_replaces_spec() {
        let mut topo = topology();
        let now = Instant::now();
        let mut svc = Service::new("default", "web");
        topo.apply(StateEvent::Service(set(svc.clone())), now);

        svc.cluster_ip = Some("10.96.0.10".into());
        topo.apply(StateEvent::Service(set(svc)), now);

        assert_eq!(topo.len(), 1);
        assert_eq!(
            topo.service("default:web").unwrap().service().cluster_ip.as_deref(),
            Some("10.96.0.10")
        );
    }

    #[test]
    fn out_of_order_events_are_replayed() {
        let mut topo = topology();
        let now = Instant::now();
        let api = Deployment::new("default", "web", "api");
        let stale = Pod::new("default", "web", "api", "api-9");

        topo.apply(StateEvent::Deployment(set(api.clone())), now);
        topo.apply(StateEvent::Pod(set(stale.clone())), now);
        topo.apply(StateEvent::Pod(remove(stale)), now);
        topo.apply(
            StateEvent::Pod(set(Pod::new("default", "web", "api", "api-0"))),
            now,
        );
        assert!(topo.service("default:web").is_none());
        assert_eq!(topo.pending(), 4);

        topo.apply(StateEvent::Service(set(Service::new("default", "web"))), now);

        let web = topo.service("default:web").unwrap();
        assert!(web.deployment(&api.self_link()).is_some());
        let pods: Vec<String> = web.pods().map(|p| p.self_link()).collect();
        assert_eq!(pods, vec!["default:web:api:api-0"]);
        assert_eq!(topo.pending(), 0);
    }

    #[test]
    fn expired_out_of_order_events_are_dropped() {
        let mut topo = Topology::with_pending_bounds(
            Arc::new(ClusterState::new()),
            Duration::from_secs(5),
            16,
        );
        let start = Instant::now();
        topo.apply(
            StateEvent::Deployment(set(Deployment::new("default", "web", "api"))),
            start,
        );
        topo.apply(
            StateEvent::Service(set(Service::new("default", "web"))),
            start + Duration::from_secs(6),
        );
        assert_eq!(topo.service("default:web").unwrap().deployments().count(), 0);
    }

    #[test]
    fn service_remove_drops_everything() {
        let mut topo = topology();
        let now = Instant::now();
        let web = Service::new("default", "web");

        topo.apply(StateEvent::Service(set(web.clone())), now);
        topo.apply(
            StateEvent::Deployment(set(Deployment::new("default", "web", "api"))),
            now,
        );
        topo.apply(StateEvent::Service(remove(web)), now);
        // Late events for the removed service must not bring it back
        topo.apply(
            StateEvent::Pod(set(Pod::new("default", "web", "api", "api-0"))),
            now,
        );

        assert!(topo.service("default:web").is_none());
        assert!(topo.is_empty());
    }

    #[test]
    fn events_without_payload_are_ignored() {
        let mut topo = topology();
        let now = Instant::now();
        let empty = |action| Event::<Service> {
            revision: 0,
            action,
            data: None,
        };
        topo.apply(StateEvent::Service(empty(Action::Set)), now);
        topo.apply(StateEvent::Service(empty(Action::Remove)), now);
        topo.apply(
            StateEvent::Pod(Event {
                revision: 0,
                action: Action::Set,
                data: None,
            }),
            now,
        );
        assert!(topo.is_empty());
        assert_eq!(topo.pending(), 0);
    }

    async fn wait_for(
        handle: &StateHandle,
        link: &str,
        check: impl Fn(Option<&ServiceState>) -> bool,
    ) {
        for _ in 0..200 {
            let state = handle.service(link).await.unwrap();
            if check(state.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state for {} never converged", link);
    }

    #[tokio::test]
    async fn restore_then_follow_watches() {
        let registry = Registry::in_memory().await.unwrap();
        let namespaces = NamespaceModel::new(registry.clone());
        let services = ServiceModel::new(registry.clone());
        let deployments = DeploymentModel::new(registry.clone());
        let pods = PodModel::new(registry.clone());

        namespaces.put(&Namespace::new("default")).await.unwrap();
        services.put(&Service::new("default", "web")).await.unwrap();
        deployments
            .put(&Deployment::new("default", "web", "api"))
            .await
            .unwrap();
        pods.put(&Pod::new("default", "web", "api", "api-0"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let running = Reconciler::new(registry.clone())
            .restore(cancel.clone())
            .await
            .unwrap();
        let handle = running.handle();

        let web = handle.service("default:web").await.unwrap().unwrap();
        assert_eq!(web.deployments().count(), 1);
        assert_eq!(web.pods().count(), 1);

        let mut pod = Pod::new("default", "web", "api", "api-1");
        pod.status = PodStatus::Running;
        pod.pod_ip = Some("10.42.0.7".into());
        pods.put(&pod).await.unwrap();
        wait_for(&handle, "default:web", |s| {
            s.is_some_and(|s| s.upstreams() == vec!["10.42.0.7".to_string()])
        })
        .await;

        services.put(&Service::new("default", "db")).await.unwrap();
        deployments
            .put(&Deployment::new("default", "db", "pg"))
            .await
            .unwrap();
        wait_for(&handle, "default:db", |s| {
            s.is_some_and(|s| s.deployments().count() == 1)
        })
        .await;

        services.delete(&Service::new("default", "web")).await.unwrap();
        wait_for(&handle, "default:web", |s| s.is_none()).await;
        assert_eq!(handle.services().await.unwrap(), vec!["default:db"]);

        running.shutdown().await;
        assert!(handle.services().await.is_err());
    }

    #[tokio::test]
    async fn empty_registry_restores_empty_topology() {
        let registry = Registry::in_memory().await.unwrap();
        let running = Reconciler::new(registry)
            .restore(CancellationToken::new())
            .await
            .unwrap();
        assert!(running.handle().services().await.unwrap().is_empty());
        running.shutdown().await;
    }
}
