use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Owned, link, registry_key};
use pkg_constants::state::DEPLOYMENTS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Name of the owning service within `namespace`.
    pub service: String,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(namespace: &str, service: &str, name: &str) -> Self {
        Self {
            id: link(&[namespace, service, name]),
            name: name.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Deployment {
    const COLLECTION: &'static str = DEPLOYMENTS;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn self_link(&self) -> String {
        link(&[&self.namespace, &self.service, &self.name])
    }

    fn key(&self) -> String {
        registry_key(DEPLOYMENTS, &[&self.namespace, &self.service, &self.name])
    }
}

impl Owned for Deployment {
    fn service_link(&self) -> String {
        link(&[&self.namespace, &self.service])
    }
}
