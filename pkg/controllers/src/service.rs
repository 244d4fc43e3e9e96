use pkg_state::{DeploymentModel, PodModel};
use pkg_types::deployment::Deployment;
use pkg_types::entity::{Entity, Owned};
use pkg_types::pod::{Pod, PodStatus};
use pkg_types::service::Service;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::cluster::ClusterState;

/// Live topology of one service: its spec plus the deployments and pods
/// that name it as their owner.
///
/// Every setter is idempotent and ignores entities owned by another
/// service, so events may be applied more than once and in any order
/// relative to other collections.
#[derive(Debug, Clone)]
pub struct ServiceState {
    cluster: Arc<ClusterState>,
    link: String,
    service: Service,
    deployments: BTreeMap<String, Deployment>,
    pods: BTreeMap<String, Pod>,
}

impl ServiceState {
    pub fn new(cluster: Arc<ClusterState>, service: Service) -> Self {
        Self {
            cluster,
            link: service.self_link(),
            service,
            deployments: BTreeMap::new(),
            pods: BTreeMap::new(),
        }
    }

    /// Load this service's deployments and pods from the registry.
    pub async fn restore(
        &mut self,
        deployments: &DeploymentModel,
        pods: &PodModel,
    ) -> anyhow::Result<()> {
        let namespace = self.service.namespace.clone();
        let name = self.service.name.clone();

        for deployment in deployments.list_owned(&namespace, &name).await? {
            self.set_deployment(deployment);
        }
        for pod in pods.list_owned(&namespace, &name).await? {
            self.set_pod(pod);
        }

        debug!(
            "Service {} restored: {} deployments, {} pods",
            self.link,
            self.deployments.len(),
            self.pods.len()
        );
        Ok(())
    }

    /// Replace the stored service spec.
    pub fn set_service(&mut self, service: Service) {
        if service.self_link() != self.link {
            return;
        }
        self.service = service;
    }

    /// Insert or replace a deployment. Returns `false` if it belongs elsewhere.
    pub fn set_deployment(&mut self, deployment: Deployment) -> bool {
        if deployment.service_link() != self.link {
            return false;
        }
        self.deployments.insert(deployment.self_link(), deployment);
        true
    }

    /// Returns `true` if the deployment was tracked.
    pub fn del_deployment(&mut self, deployment: &Deployment) -> bool {
        self.deployments.remove(&deployment.self_link()).is_some()
    }

    /// Insert or replace a pod. Returns `false` if it belongs elsewhere.
    pub fn set_pod(&mut self, pod: Pod) -> bool {
        if pod.service_link() != self.link {
            return false;
        }
        self.pods.insert(pod.self_link(), pod);
        true
    }

    /// Returns `true` if the pod was tracked.
    pub fn del_pod(&mut self, pod: &Pod) -> bool {
        self.pods.remove(&pod.self_link()).is_some()
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments.values()
    }

    pub fn deployment(&self, link: &str) -> Option<&Deployment> {
        self.deployments.get(link)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn pod(&self, link: &str) -> Option<&Pod> {
        self.pods.get(link)
    }

    /// Pods of one deployment.
    pub fn pods_of<'a>(&'a self, deployment: &'a str) -> impl Iterator<Item = &'a Pod> + 'a {
        self.pods
            .values()
            .filter(move |pod| pod.deployment_link() == deployment)
    }

    /// Addresses of running pods, sorted and de-duplicated.
    pub fn upstreams(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .pods
            .values()
            .filter(|pod| pod.status == PodStatus::Running)
            .filter_map(|pod| pod.pod_ip.clone())
            .collect();
        ips.sort();
        ips.dedup();
        ips
    }
}
