//! State store / reconciler constants.

/// Root of every persisted entity key.
pub const REGISTRY_PREFIX: &str = "/registry";

/// Collection names, used as the second key segment: `/registry/<collection>/...`.
pub const NAMESPACES: &str = "namespaces";
pub const NODES: &str = "nodes";
pub const SERVICES: &str = "services";
pub const DEPLOYMENTS: &str = "deployments";
pub const PODS: &str = "pods";
pub const ENDPOINTS: &str = "endpoints";

/// Number of recent events kept by the event log for watch replay.
pub const EVENT_LOG_CAPACITY: usize = 4096;

/// Capacity of the live watch broadcast channel.
pub const WATCH_BROADCAST_CAPACITY: usize = 1024;

/// Capacity of per-watch and reconciler event channels.
pub const WATCH_CHANNEL_CAPACITY: usize = 256;

/// First watch reconnect delay, in milliseconds. Doubles on each retry.
pub const WATCH_BACKOFF_INITIAL_MS: u64 = 100;

/// Upper bound for the watch reconnect delay, in milliseconds.
pub const WATCH_BACKOFF_MAX_MS: u64 = 5_000;

/// How long out-of-order deployment/pod events wait for their service.
pub const PENDING_RETENTION_SECS: u64 = 60;

/// Maximum buffered out-of-order events per owning service.
pub const PENDING_PER_OWNER_LIMIT: usize = 256;
