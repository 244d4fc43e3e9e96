use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Owned, link, registry_key};
use pkg_constants::state::PODS;

// --- Pod status ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PodStatus {
    #[default]
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodStatus::Pending => write!(f, "Pending"),
            PodStatus::Scheduled => write!(f, "Scheduled"),
            PodStatus::Running => write!(f, "Running"),
            PodStatus::Succeeded => write!(f, "Succeeded"),
            PodStatus::Failed => write!(f, "Failed"),
            PodStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Pod ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Name of the owning service within `namespace`.
    pub service: String,
    /// Name of the deployment that created this pod.
    pub deployment: String,
    #[serde(default)]
    pub status: PodStatus,
    /// Data-plane address, used as an upstream by the proxy.
    #[serde(default)]
    pub pod_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Pod {
    pub fn new(namespace: &str, service: &str, deployment: &str, name: &str) -> Self {
        Self {
            id: link(&[namespace, service, deployment, name]),
            name: name.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
            deployment: deployment.to_string(),
            status: PodStatus::Pending,
            pod_ip: None,
            created_at: Utc::now(),
        }
    }

    /// Self-link of the deployment that created this pod.
    pub fn deployment_link(&self) -> String {
        link(&[&self.namespace, &self.service, &self.deployment])
    }
}

impl Entity for Pod {
    const COLLECTION: &'static str = PODS;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn self_link(&self) -> String {
        link(&[&self.namespace, &self.service, &self.deployment, &self.name])
    }

    fn key(&self) -> String {
        registry_key(
            PODS,
            &[&self.namespace, &self.service, &self.deployment, &self.name],
        )
    }
}

impl Owned for Pod {
    fn service_link(&self) -> String {
        link(&[&self.namespace, &self.service])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_hierarchical() {
        let pod = Pod::new("default", "web", "api", "api-0");
        assert_eq!(pod.self_link(), "default:web:api:api-0");
        assert_eq!(pod.service_link(), "default:web");
        assert_eq!(pod.deployment_link(), "default:web:api");
        assert!(pod.key().starts_with("/registry/pods/default/"));
    }

    #[test]
    fn pod_decodes_with_defaults() {
        let json = r#"{
            "id": "x", "name": "api-0", "namespace": "default",
            "service": "web", "deployment": "api",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let pod: Pod = serde_json::from_str(json).unwrap();
        assert_eq!(pod.status, PodStatus::Pending);
        assert!(pod.pod_ip.is_none());
    }
}
