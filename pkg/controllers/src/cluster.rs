use chrono::{DateTime, Utc};
use pkg_state::NodeModel;
use pkg_types::node::{Node, NodeStatus, ResourceRequirements};
use std::collections::BTreeMap;
use tracing::info;

/// What the reconciler keeps about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub name: String,
    pub address: String,
    pub ready: bool,
    pub unschedulable: bool,
    pub capacity: ResourceRequirements,
    pub allocated: ResourceRequirements,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            address: node.address.clone(),
            ready: node.status == NodeStatus::Ready,
            unschedulable: node.unschedulable,
            capacity: node.capacity,
            allocated: node.allocated,
        }
    }
}

/// Cluster-level facts, restored once at startup and shared read-only
/// with every `ServiceState`.
#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: BTreeMap<String, NodeSummary>,
    restored_at: Option<DateTime<Utc>>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load node facts from the registry, replacing anything held before.
    pub async fn restore(&mut self, nodes: &NodeModel) -> anyhow::Result<()> {
        let listed = nodes.list().await?;
        self.nodes = listed
            .iter()
            .map(|node| (node.name.clone(), NodeSummary::from(node)))
            .collect();
        self.restored_at = Some(Utc::now());

        info!(
            "Cluster state restored: {} nodes ({} ready)",
            self.node_count(),
            self.ready_nodes()
        );
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeSummary> {
        self.nodes.get(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn ready_nodes(&self) -> usize {
        self.nodes.values().filter(|n| n.ready).count()
    }

    /// Total capacity of ready, schedulable nodes.
    pub fn capacity(&self) -> ResourceRequirements {
        let mut total = ResourceRequirements::default();
        for node in self.nodes.values().filter(|n| n.ready && !n.unschedulable) {
            total += node.capacity;
        }
        total
    }

    pub fn restored_at(&self) -> Option<DateTime<Utc>> {
        self.restored_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::Registry;

    #[tokio::test]
    async fn restore_summarizes_nodes() {
        let registry = Registry::in_memory().await.unwrap();
        let nodes = NodeModel::new(registry);

        let mut a = Node::new("node-a", "10.0.0.1:10250");
        a.capacity = ResourceRequirements {
            cpu_millis: 2000,
            memory_bytes: 4 << 30,
        };
        let mut b = Node::new("node-b", "10.0.0.2:10250");
        b.capacity = a.capacity;
        b.status = NodeStatus::NotReady;
        let mut c = Node::new("node-c", "10.0.0.3:10250");
        c.capacity = a.capacity;
        c.unschedulable = true;
        for node in [&a, &b, &c] {
            nodes.put(node).await.unwrap();
        }

        let mut cluster = ClusterState::new();
        assert!(cluster.restored_at().is_none());
        cluster.restore(&nodes).await.unwrap();

        assert_eq!(cluster.node_count(), 3);
        assert_eq!(cluster.ready_nodes(), 2);
        assert_eq!(cluster.capacity().cpu_millis, 2000);
        assert!(!cluster.node("node-b").unwrap().ready);
        assert!(cluster.restored_at().is_some());
    }
}
