use pkg_types::endpoint::{EndpointManifest, EndpointState, Protocol, format_port_map};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{Span, debug, error, info, info_span, instrument, warn};

use crate::error::ProxyError;
use crate::forwarder::Forwarder;
use crate::link::{IpLink, Link, bind_address, unbind_address};
use crate::rules::{ServiceRule, translate};

/// Reconciles endpoint manifests against the kernel forwarding tables and
/// keeps VIPs bound on the data-plane link.
///
/// Calls for the same VIP are expected to be serialized by the caller.
pub struct Proxy {
    forwarder: Arc<dyn Forwarder>,
    link: Option<Arc<dyn Link>>,
    span: Span,
}

impl Proxy {
    pub fn new(forwarder: Arc<dyn Forwarder>, link: Option<Arc<dyn Link>>) -> Self {
        Self {
            forwarder,
            link,
            span: info_span!("proxy"),
        }
    }

    /// Build a proxy bound to the first host link named `link_prefix*`.
    /// Without a matching link the proxy still runs, but cannot bind VIPs.
    pub async fn discover(
        forwarder: Arc<dyn Forwarder>,
        link_prefix: &str,
    ) -> Result<Self, ProxyError> {
        let link = match IpLink::find(link_prefix).await? {
            Some(link) => {
                info!("Using link {} for virtual ips", link.name());
                Some(Arc::new(link) as Arc<dyn Link>)
            }
            None => {
                warn!("No link matching prefix `{}`, vips will not be bound", link_prefix);
                None
            }
        };
        Ok(Self::new(forwarder, link))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn link(&self) -> Option<&dyn Link> {
        self.link.as_deref()
    }

    /// Install the rules for `manifest` and return the observed state of its VIP.
    ///
    /// A manifest without upstreams installs nothing and returns `None`.
    /// Individual rule failures are logged and leave that rule out; if the
    /// resulting state cannot be read back, the services created here are
    /// removed again.
    #[instrument(parent = &self.span, skip_all, fields(vip = %manifest.ip()))]
    pub async fn create(
        &self,
        manifest: &EndpointManifest,
    ) -> Result<Option<EndpointState>, ProxyError> {
        debug!("Create virtual services for upstreams {:?}", manifest.upstreams);

        let rules = translate(manifest).inspect_err(|e| error!("Failed to translate manifest: {}", e))?;
        if rules.destinations().is_empty() {
            debug!("Skip create: no destinations");
            return Ok(None);
        }

        let mut created = Vec::new();
        for (key, rule) in rules.iter() {
            debug!("Create service {}", key);
            if let Err(e) = self.forwarder.new_service(&rule.service).await {
                error!("Failed to create service {}: {}", key, e);
            }
            self.add_destinations(rule).await;
            created.push(&rule.service);
        }

        match self.state_by_ip(manifest.ip()).await {
            Ok(state) => Ok(state),
            Err(e) => {
                error!("Failed to read back state: {}", e);
                for service in created {
                    debug!("Compensating: deleting service {}", service.endpoint());
                    if let Err(e) = self.forwarder.del_service(service).await {
                        error!("Failed to delete service {}: {}", service.endpoint(), e);
                    }
                }
                Err(e)
            }
        }
    }

    /// Move the live rules from `current` to `manifest`, touching only what differs.
    #[instrument(parent = &self.span, skip_all, fields(vip = %manifest.ip()))]
    pub async fn update(
        &self,
        current: &EndpointState,
        manifest: &EndpointManifest,
    ) -> Result<Option<EndpointState>, ProxyError> {
        let desired = translate(manifest).inspect_err(|e| error!("Failed to translate manifest: {}", e))?;
        let live = translate(&EndpointManifest::from_state(current))
            .inspect_err(|e| error!("Failed to translate current state: {}", e))?;

        for (key, old) in live.iter() {
            match desired.get(key) {
                None => {
                    debug!("Delete service {}", key);
                    if let Err(e) = self.forwarder.del_service(&old.service).await {
                        error!("Failed to delete service {}: {}", key, e);
                    }
                }
                Some(new) => self.sync_destinations(key, old, new).await,
            }
        }

        for (key, new) in desired.iter() {
            if live.get(key).is_none() {
                debug!("Create service {}", key);
                if let Err(e) = self.forwarder.new_service(&new.service).await {
                    error!("Failed to create service {}: {}", key, e);
                }
                self.add_destinations(new).await;
            }
        }

        if current.ip() != manifest.ip() {
            self.unbind(current.ip()).await;
        }

        self.state_by_ip(manifest.ip()).await
    }

    /// Remove every virtual service implied by `state`, then any other live
    /// service still on its VIP, and unbind the VIP.
    /// Failures are logged; the remaining rules are still removed.
    #[instrument(parent = &self.span, skip_all, fields(vip = %state.ip()))]
    pub async fn destroy(&self, state: &EndpointState) -> Result<(), ProxyError> {
        let rules = translate(&EndpointManifest::from_state(state))?;

        let mut vips = BTreeSet::from([state.ip().to_string()]);
        for (key, rule) in rules.iter() {
            debug!("Delete service {}", key);
            if let Err(e) = self.forwarder.del_service(&rule.service).await {
                error!("Failed to delete service {}: {}", key, e);
            }
            vips.insert(rule.service.address.to_string());
        }

        // Services without destinations leave no trace in the state's port map.
        match self.forwarder.services().await {
            Ok(live) => {
                for service in live.iter().filter(|s| vips.contains(&s.address.to_string())) {
                    debug!("Delete leftover service {}", service.endpoint());
                    if let Err(e) = self.forwarder.del_service(service).await {
                        error!("Failed to delete service {}: {}", service.endpoint(), e);
                    }
                }
            }
            Err(e) => error!("Failed to list services: {}", e),
        }

        for vip in vips {
            self.unbind(&vip).await;
        }
        Ok(())
    }

    /// Inventory of every live VIP, rebuilt from the forwarding tables.
    ///
    /// Each virtual service reports the port of its first destination as
    /// its internal port; destinations on any other port stop that
    /// service's scan. A tcp and a udp service on the same external and
    /// internal port fold into one `port/*` entry. Every VIP seen is bound
    /// on the link.
    #[instrument(parent = &self.span, skip_all)]
    pub async fn info(&self) -> Result<BTreeMap<String, EndpointState>, ProxyError> {
        self.forwarder.ensure_module().await?;
        let services = self
            .forwarder
            .services()
            .await
            .inspect_err(|e| error!("Failed to list services: {}", e))?;
        debug!("{} virtual services", services.len());

        let mut states: BTreeMap<String, EndpointState> = BTreeMap::new();
        for service in &services {
            let destinations = match self.forwarder.destinations(service).await {
                Ok(destinations) => destinations,
                Err(e) => {
                    error!("Failed to list destinations of {}: {}", service.endpoint(), e);
                    continue;
                }
            };

            let vip = service.address.to_string();
            let state = states
                .entry(vip.clone())
                .or_insert_with(|| EndpointState::new(&vip));

            let mut target = None;
            for destination in &destinations {
                let port = *target.get_or_insert(destination.port);
                if port != destination.port {
                    debug!(
                        "{}: destination port {} differs from {}, stop scan",
                        service.endpoint(),
                        destination.port,
                        port
                    );
                    break;
                }
                let address = destination.address.to_string();
                if !state.upstreams.contains(&address) {
                    state.upstreams.push(address);
                }
            }

            let Some(port) = target else { continue };
            let declared = format_port_map(port, service.protocol.declared());
            let merged = match state.spec.port_map.get(&service.port) {
                Some(existing) if *existing != declared && existing.starts_with(&format!("{}/", port)) => {
                    format_port_map(port, Protocol::Any)
                }
                Some(existing) => existing.clone(),
                None => declared,
            };
            state.spec.port_map.insert(service.port, merged);
        }

        for vip in states.keys() {
            self.bind(vip).await;
        }

        Ok(states)
    }

    /// The live state of one VIP, if any rules exist for it.
    pub async fn state_by_ip(&self, ip: &str) -> Result<Option<EndpointState>, ProxyError> {
        Ok(self.info().await?.remove(ip))
    }

    async fn add_destinations(&self, rule: &ServiceRule) {
        for destination in rule.destinations.values() {
            debug!(
                "Add destination {} to {}",
                destination.endpoint(),
                rule.service.endpoint()
            );
            if let Err(e) = self
                .forwarder
                .new_destination(&rule.service, destination)
                .await
            {
                error!(
                    "Failed to add destination {} to {}: {}",
                    destination.endpoint(),
                    rule.service.endpoint(),
                    e
                );
            }
        }
    }

    async fn sync_destinations(&self, key: &str, old: &ServiceRule, new: &ServiceRule) {
        for (id, destination) in &old.destinations {
            if !new.destinations.contains_key(id) {
                debug!("{}: remove destination {}", key, id);
                if let Err(e) = self
                    .forwarder
                    .del_destination(&old.service, destination)
                    .await
                {
                    error!("Failed to remove destination {} from {}: {}", id, key, e);
                }
            }
        }
        for (id, destination) in &new.destinations {
            if !old.destinations.contains_key(id) {
                debug!("{}: add destination {}", key, id);
                if let Err(e) = self
                    .forwarder
                    .new_destination(&new.service, destination)
                    .await
                {
                    error!("Failed to add destination {} to {}: {}", id, key, e);
                }
            }
        }
    }

    async fn bind(&self, vip: &str) {
        let Some(link) = self.link.as_deref() else {
            debug!("No link, {} left unbound", vip);
            return;
        };
        if let Err(e) = bind_address(link, vip).await {
            warn!("Failed to bind {} to {}: {}", vip, link.name(), e);
        }
    }

    async fn unbind(&self, vip: &str) {
        let Some(link) = self.link.as_deref() else {
            debug!("No link, {} not unbound", vip);
            return;
        };
        if let Err(e) = unbind_address(link, vip).await {
            error!("Failed to unbind {} from {}: {}", vip, link.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{MemoryForwarder, Mutation};
    use crate::link::MemoryLink;
    use crate::rules::{Destination, L4Protocol, VirtualService};
    use std::net::Ipv4Addr;

    const VIP: &str = "10.96.0.10";

    fn manifest(ports: &[(u16, &str)], upstreams: &[&str]) -> EndpointManifest {
        EndpointManifest::new(
            VIP,
            ports.iter().map(|(p, d)| (*p, d.to_string())).collect(),
            upstreams.iter().map(|u| u.to_string()).collect(),
        )
    }

    fn proxy() -> (Proxy, Arc<MemoryForwarder>, Arc<MemoryLink>) {
        let fwd = Arc::new(MemoryForwarder::new());
        let link = Arc::new(MemoryLink::new("lb0"));
        let proxy = Proxy::new(fwd.clone(), Some(link.clone()));
        (proxy, fwd, link)
    }

    #[tokio::test]
    async fn create_without_upstreams_does_nothing() {
        let (proxy, fwd, link) = proxy();
        let state = proxy.create(&manifest(&[(8080, "80/tcp")], &[])).await.unwrap();

        assert!(state.is_none());
        assert!(fwd.mutations().await.is_empty());
        assert!(link.addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_then_info_round_trips() {
        let (proxy, _fwd, link) = proxy();
        let m = manifest(&[(8080, "80/tcp"), (53, "5353/*")], &["10.0.0.1", "10.0.0.2"]);

        let state = proxy.create(&m).await.unwrap().unwrap();
        assert_eq!(state.ip(), VIP);
        assert_eq!(state.spec.port_map, m.spec.port_map);
        assert_eq!(state.upstreams, vec!["10.0.0.1", "10.0.0.2"]);

        let inventory = proxy.info().await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[VIP], state);
        assert_eq!(
            link.addresses().await.unwrap(),
            vec![VIP.parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn update_touches_only_changed_destinations() {
        let (proxy, fwd, _link) = proxy();
        let before = proxy
            .create(&manifest(&[(8080, "80/tcp")], &["10.0.0.1", "10.0.0.2"]))
            .await
            .unwrap()
            .unwrap();
        fwd.clear_mutations().await;

        let after = proxy
            .update(&before, &manifest(&[(8080, "80/tcp")], &["10.0.0.2", "10.0.0.3"]))
            .await
            .unwrap()
            .unwrap();

        let svc = VirtualService::new(VIP.parse().unwrap(), 8080, L4Protocol::Tcp);
        assert_eq!(
            fwd.mutations().await,
            vec![
                Mutation::DelDestination(svc.clone(), Destination::new("10.0.0.1".parse().unwrap(), 80)),
                Mutation::NewDestination(svc, Destination::new("10.0.0.3".parse().unwrap(), 80)),
            ]
        );
        assert_eq!(after.upstreams, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn update_replaces_services_on_port_change() {
        let (proxy, fwd, _link) = proxy();
        let before = proxy
            .create(&manifest(&[(8080, "80/tcp"), (9090, "90/udp")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();

        let after = proxy
            .update(&before, &manifest(&[(8080, "80/tcp"), (7070, "70/udp")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();

        let ports: Vec<u16> = after.spec.port_map.keys().copied().collect();
        assert_eq!(ports, vec![7070, 8080]);
        assert_eq!(after.spec.port_map[&7070], "70/udp");
        assert_eq!(fwd.services().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_to_new_vip_unbinds_the_old_one() {
        let (proxy, fwd, link) = proxy();
        let before = proxy
            .create(&manifest(&[(80, "80/tcp")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();

        let mut moved = manifest(&[(80, "80/tcp")], &["10.0.0.1"]);
        moved.spec.ip = "10.96.0.20".into();
        let after = proxy.update(&before, &moved).await.unwrap().unwrap();

        assert_eq!(after.ip(), "10.96.0.20");
        assert_eq!(fwd.services().await.unwrap().len(), 1);
        assert_eq!(
            link.addresses().await.unwrap(),
            vec!["10.96.0.20".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn destroy_removes_rules_and_binding() {
        let (proxy, fwd, link) = proxy();
        let state = proxy
            .create(&manifest(&[(8080, "80/*")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.spec.port_map[&8080], "80/*");

        proxy.destroy(&state).await.unwrap();
        assert!(fwd.services().await.unwrap().is_empty());
        assert!(link.addresses().await.unwrap().is_empty());
        assert!(proxy.info().await.unwrap().is_empty());

        // Nothing left to remove.
        proxy.destroy(&state).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_removes_services_left_without_destinations() {
        let (proxy, fwd, link) = proxy();
        let before = proxy
            .create(&manifest(&[(8080, "80/tcp")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();

        let drained = proxy
            .update(&before, &manifest(&[(8080, "80/tcp")], &[]))
            .await
            .unwrap()
            .unwrap();
        assert!(drained.spec.port_map.is_empty());
        assert_eq!(fwd.services().await.unwrap().len(), 1);

        proxy.destroy(&drained).await.unwrap();
        assert!(fwd.services().await.unwrap().is_empty());
        assert!(link.addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn destroy_leaves_other_vips_alone() {
        let (proxy, fwd, _link) = proxy();
        let web = proxy
            .create(&manifest(&[(8080, "80/tcp")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();
        let mut other = manifest(&[(53, "53/udp")], &["10.0.0.2"]);
        other.spec.ip = "10.96.0.20".into();
        proxy.create(&other).await.unwrap().unwrap();

        proxy.destroy(&web).await.unwrap();
        let left = fwd.services().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].address.to_string(), "10.96.0.20");
    }

    #[tokio::test]
    async fn info_fails_when_module_cannot_load() {
        let (proxy, fwd, _link) = proxy();
        fwd.fail_module(true).await;
        assert!(matches!(proxy.info().await, Err(ProxyError::ModuleLoad { .. })));
    }

    #[tokio::test]
    async fn info_fails_when_services_cannot_be_listed() {
        let (proxy, fwd, _link) = proxy();
        proxy
            .create(&manifest(&[(8080, "80/tcp")], &["10.0.0.1"]))
            .await
            .unwrap();
        fwd.fail_listing(true).await;
        assert!(matches!(proxy.info().await, Err(ProxyError::Command { .. })));
    }

    #[tokio::test]
    async fn create_compensates_when_state_cannot_be_read() {
        let (proxy, fwd, _link) = proxy();
        fwd.fail_module(true).await;

        let err = proxy
            .create(&manifest(&[(8080, "80/*")], &["10.0.0.1", "10.0.0.2"]))
            .await;
        assert!(matches!(err, Err(ProxyError::ModuleLoad { .. })));

        assert!(fwd.services().await.unwrap().is_empty());
        let deletes = fwd
            .mutations()
            .await
            .into_iter()
            .filter(|m| matches!(m, Mutation::DelService(_)))
            .count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn failed_destination_is_absent_from_state() {
        let (proxy, fwd, _link) = proxy();
        fwd.reject_address("10.0.0.66".parse().unwrap()).await;

        let state = proxy
            .create(&manifest(&[(8080, "80/tcp")], &["10.0.0.1", "10.0.0.66"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.upstreams, vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn malformed_manifest_touches_nothing() {
        let (proxy, fwd, _link) = proxy();
        let err = proxy
            .create(&manifest(&[(8080, "80/sctp")], &["10.0.0.1"]))
            .await;
        assert!(matches!(err, Err(ProxyError::PortMap(_))));
        assert!(fwd.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn mixed_target_ports_keep_the_first() {
        let (proxy, fwd, _link) = proxy();
        let svc = VirtualService::new(VIP.parse().unwrap(), 8080, L4Protocol::Tcp);
        fwd.new_service(&svc).await.unwrap();
        fwd.new_destination(&svc, &Destination::new("10.0.0.1".parse().unwrap(), 80))
            .await
            .unwrap();
        fwd.new_destination(&svc, &Destination::new("10.0.0.2".parse().unwrap(), 81))
            .await
            .unwrap();

        let state = proxy.state_by_ip(VIP).await.unwrap().unwrap();
        assert_eq!(state.spec.port_map[&8080], "80/tcp");
        assert_eq!(state.upstreams, vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn runs_without_a_link() {
        let fwd = Arc::new(MemoryForwarder::new());
        let proxy = Proxy::new(fwd, None);
        let state = proxy
            .create(&manifest(&[(8080, "80/tcp")], &["10.0.0.1"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.upstreams, vec!["10.0.0.1"]);
        assert!(proxy.link().is_none());
    }
}
