//! Filesystem path and tool constants.

/// Default config file path for the daemon.
pub const DEFAULT_DAEMON_CONFIG: &str = "/etc/lbd/config.yaml";

/// Default data directory for the daemon state store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/lbd-data";

/// Sysfs directory enumerated to find network links.
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// IPVS administration tool.
pub const IPVSADM_BIN: &str = "ipvsadm";

/// iproute2 tool used for link address management.
pub const IP_BIN: &str = "ip";

/// Module loader.
pub const MODPROBE_BIN: &str = "modprobe";
