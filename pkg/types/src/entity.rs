use pkg_constants::state::REGISTRY_PREFIX;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A persisted object stored under `/registry/<COLLECTION>/...`.
///
/// The self-link is the stable, hierarchical identifier used as a map key
/// by the reconcilers (e.g. `default:web` for a service, `default:web:api`
/// for one of its deployments).
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn name(&self) -> &str;

    /// Namespace for namespaced kinds, `None` for cluster-scoped ones.
    fn namespace(&self) -> Option<&str>;

    fn self_link(&self) -> String;

    /// Storage key. Always begins with the collection prefix, and with the
    /// namespace prefix for namespaced kinds.
    fn key(&self) -> String;
}

/// An entity that belongs to exactly one service.
pub trait Owned: Entity {
    /// Self-link of the owning service.
    fn service_link(&self) -> String;
}

/// `/registry/<collection>/`
pub fn collection_prefix(collection: &str) -> String {
    format!("{}/{}/", REGISTRY_PREFIX, collection)
}

/// `/registry/<collection>/<namespace>/`
pub fn namespace_prefix(collection: &str, namespace: &str) -> String {
    format!("{}{}/", collection_prefix(collection), namespace)
}

/// `/registry/<collection>/a/b/`: everything stored below the given segments.
pub fn owner_prefix(collection: &str, segments: &[&str]) -> String {
    format!("{}/", registry_key(collection, segments))
}

/// Join key segments below a collection: `/registry/<collection>/a/b/c`.
pub fn registry_key(collection: &str, segments: &[&str]) -> String {
    format!("{}{}", collection_prefix(collection), segments.join("/"))
}

/// Join self-link segments: `a:b:c`.
pub fn link(segments: &[&str]) -> String {
    segments.join(":")
}
