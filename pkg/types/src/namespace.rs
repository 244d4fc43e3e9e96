use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, registry_key};
use pkg_constants::state::NAMESPACES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Namespace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }
}

impl Entity for Namespace {
    const COLLECTION: &'static str = NAMESPACES;

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
        registry_key(NAMESPACES, &[&self.name])
    }
}
