//! Load balancer / network-related constants.

/// Name prefix of the link that carries virtual IPs on the data plane.
pub const DEFAULT_LINK_PREFIX: &str = "lb";

/// IPVS scheduler used for every virtual service (round-robin).
pub const IPVS_SCHEDULER: &str = "rr";

/// Weight assigned to every destination.
pub const DESTINATION_WEIGHT: u32 = 1;

/// Prefix length used when a VIP is bound to the data-plane link.
pub const VIP_PREFIX_LEN: u8 = 32;

/// Kernel module that provides the L4 forwarder.
pub const IPVS_MODULE: &str = "ip_vs";

/// Protocol token matching both tcp and udp in a `port/protocol` string.
pub const PROTO_ANY: &str = "*";

/// Protocol token for tcp in a `port/protocol` string.
pub const PROTO_TCP: &str = "tcp";

/// Protocol token for udp in a `port/protocol` string.
pub const PROTO_UDP: &str = "udp";
