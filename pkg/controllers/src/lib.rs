//! Cluster topology reconciliation: restores cluster and per-service state
//! from the registry at startup, then keeps it current from watch streams.

pub mod cluster;
pub mod pending;
pub mod service;
pub mod state;

pub use cluster::ClusterState;
pub use service::ServiceState;
pub use state::{Reconciler, RunningState, StateEvent, StateHandle, Topology};
