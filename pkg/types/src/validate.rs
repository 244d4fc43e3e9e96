use anyhow::{Result, bail};

use crate::entity::Entity;

/// Validate a resource name used as a key and self-link segment.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
/// This also keeps `/` and `:` out of storage keys and links.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        bail!(
            "name '{}' contains '{}'; only lowercase letters, digits, and hyphens are allowed",
            name,
            c
        );
    }
    Ok(())
}

/// Validate the name and namespace of an entity before it is persisted.
pub fn validate_entity<T: Entity>(entity: &T) -> Result<()> {
    validate_name(entity.name())?;
    if let Some(ns) = entity.namespace() {
        validate_name(ns)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::Deployment;
    use crate::service::Service;

    #[test]
    fn valid_names() {
        assert!(validate_name("nginx").is_ok());
        assert!(validate_name("my-app").is_ok());
        assert!(validate_name("app-123").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("My-App").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("a:b").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn entities_are_validated_with_their_namespace() {
        assert!(validate_entity(&Service::new("default", "web")).is_ok());
        assert!(validate_entity(&Service::new("Default", "web")).is_err());
        assert!(validate_entity(&Deployment::new("default", "web", "api_v2")).is_err());
    }
}
