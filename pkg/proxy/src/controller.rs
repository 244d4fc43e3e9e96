use pkg_constants::state::WATCH_CHANNEL_CAPACITY;
use pkg_state::{Action, EndpointModel, Event, Registry};
use pkg_types::Entity;
use pkg_types::endpoint::{EndpointManifest, EndpointState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span};

use crate::error::ProxyError;
use crate::proxy::Proxy;

/// Drives a [`Proxy`] from the endpoint manifests stored in the registry.
///
/// On start every stored manifest is applied, then the endpoints
/// collection is followed: a put creates or updates the VIP's rules,
/// a removal destroys them.
pub struct EndpointController {
    endpoints: EndpointModel,
    proxy: Arc<Proxy>,
    /// Manifest self-link → VIP it was last applied to.
    applied: HashMap<String, String>,
    span: Span,
}

impl EndpointController {
    pub fn new(registry: Registry, proxy: Arc<Proxy>) -> Self {
        Self {
            endpoints: EndpointModel::new(registry),
            proxy,
            applied: HashMap::new(),
            span: info_span!("endpoints"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Sync, then follow the endpoints collection until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let span = self.span.clone();
        async move {
            let revision = self.sync().await?;
            info!("EndpointController synced at revision {}", revision);

            let (tx, mut rx) = mpsc::channel::<Event<EndpointManifest>>(WATCH_CHANNEL_CAPACITY);
            let endpoints = self.endpoints.clone();

            let consumer = async {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        event = rx.recv() => {
                            let Some(event) = event else { return };
                            self.handle(event).await;
                        }
                    }
                }
            };

            tokio::select! {
                _ = endpoints.follow(tx, revision, cancel.clone()) => {}
                _ = consumer => {}
            }
            info!("EndpointController stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Apply every stored manifest. Returns the revision to follow from.
    async fn sync(&mut self) -> anyhow::Result<u64> {
        let revision = self.endpoints.runtime().await.revision;
        for manifest in self.endpoints.list().await? {
            if let Err(e) = self.apply(&manifest).await {
                error!("Failed to apply {}: {}", manifest.self_link(), e);
            }
        }
        Ok(revision)
    }

    async fn handle(&mut self, event: Event<EndpointManifest>) {
        let Some(manifest) = event.data else {
            debug!("Ignore empty endpoint event at revision {}", event.revision);
            return;
        };
        let result = match event.action {
            Action::Set => self.apply(&manifest).await.map(|_| ()),
            Action::Remove => self.remove(&manifest).await,
        };
        if let Err(e) = result {
            error!("Failed to reconcile {}: {}", manifest.self_link(), e);
        }
    }

    /// Bring the VIP of `manifest` to the declared rules, moving them if the
    /// manifest's VIP changed since it was last applied.
    pub async fn apply(
        &mut self,
        manifest: &EndpointManifest,
    ) -> Result<Option<EndpointState>, ProxyError> {
        let link = manifest.self_link();
        let mut current = None;
        if let Some(previous) = self.applied.get(&link) {
            current = self.proxy.state_by_ip(previous).await?;
        }
        if current.is_none() {
            current = self.proxy.state_by_ip(manifest.ip()).await?;
        }

        let state = match current {
            Some(current) => self.proxy.update(&current, manifest).await?,
            None => self.proxy.create(manifest).await?,
        };
        debug!("Applied {} to {}", link, manifest.ip());
        self.applied.insert(link, manifest.ip().to_string());
        Ok(state)
    }

    /// Tear down the rules of a removed manifest.
    pub async fn remove(&mut self, manifest: &EndpointManifest) -> Result<(), ProxyError> {
        let link = manifest.self_link();
        let vip = self
            .applied
            .remove(&link)
            .unwrap_or_else(|| manifest.ip().to_string());
        match self.proxy.state_by_ip(&vip).await? {
            Some(state) => self.proxy.destroy(&state).await,
            None => {
                debug!("{} has no live rules on {}", link, vip);
                Ok(())
            }
        }
    }
}
