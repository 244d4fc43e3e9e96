//! Storage and watch backend: a SlateDB-backed key/value store, a revisioned
//! event log, and typed entity models on top of both.

pub mod backoff;
pub mod client;
pub mod model;
pub mod registry;
pub mod watch;

pub use model::{
    Action, DeploymentModel, EndpointModel, Event, Model, NamespaceModel, NodeModel, PodModel,
    Runtime, ServiceModel, WatchError,
};
pub use registry::Registry;
