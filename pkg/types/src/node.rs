use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, registry_key};
use pkg_constants::state::NODES;

// --- Resource requirements ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    /// CPU in millicores (1000 = 1 core)
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
}

impl std::ops::AddAssign for ResourceRequirements {
    fn add_assign(&mut self, rhs: Self) {
        self.cpu_millis += rhs.cpu_millis;
        self.memory_bytes += rhs.memory_bytes;
    }
}

// --- Node status ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    NotReady,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "Ready"),
            NodeStatus::NotReady => write!(f, "NotReady"),
            NodeStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Persisted Node object ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// Agent address (host:port)
    pub address: String,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub capacity: ResourceRequirements,
    #[serde(default)]
    pub allocated: ResourceRequirements,
    /// Cordoned nodes take no new pods.
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    pub fn new(name: &str, address: &str) -> Self {
        let now = Utc::now();
        Self {
            id: name.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            status: NodeStatus::Ready,
            registered_at: now,
            last_heartbeat: now,
            capacity: ResourceRequirements::default(),
            allocated: ResourceRequirements::default(),
            unschedulable: false,
        }
    }
}

impl Entity for Node {
    const COLLECTION: &'static str = NODES;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        None
    }

    fn self_link(&self) -> String {
        self.name.clone()
    }

    fn key(&self) -> String {
        registry_key(NODES, &[&self.name])
    }
}
