use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, link, registry_key};
use pkg_constants::state::SERVICES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    pub target_port: u16,
    /// `tcp`, `udp` or `*`
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    pkg_constants::network::PROTO_TCP.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    /// Virtual IP the proxy binds for this service.
    #[serde(default)]
    pub cluster_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Service {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            id: link(&[namespace, name]),
            name: name.to_string(),
            namespace: namespace.to_string(),
            ports: Vec::new(),
            cluster_ip: None,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Service {
    const COLLECTION: &'static str = SERVICES;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn self_link(&self) -> String {
        link(&[&self.namespace, &self.name])
    }

    fn key(&self) -> String {
        registry_key(SERVICES, &[&self.namespace, &self.name])
    }
}
