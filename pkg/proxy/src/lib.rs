//! L4 load balancing on the kernel forwarder: endpoint manifests are
//! translated into virtual services and destinations, diffed against the
//! live tables, and applied with the minimal set of changes.

mod command;
pub mod controller;
pub mod error;
pub mod forwarder;
pub mod link;
pub mod proxy;
pub mod rules;

pub use controller::EndpointController;
pub use error::ProxyError;
pub use forwarder::{Forwarder, Ipvsadm, MemoryForwarder};
pub use link::{IpLink, Link, MemoryLink};
pub use proxy::Proxy;
