use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::entity::{Entity, link, registry_key};
use pkg_constants::network::{PROTO_ANY, PROTO_TCP, PROTO_UDP};
use pkg_constants::state::ENDPOINTS;

/// Transport protocol of a `port/protocol` declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    /// Both tcp and udp.
    Any,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "{}", PROTO_TCP),
            Protocol::Udp => write!(f, "{}", PROTO_UDP),
            Protocol::Any => write!(f, "{}", PROTO_ANY),
        }
    }
}

impl FromStr for Protocol {
    type Err = PortMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            PROTO_TCP => Ok(Protocol::Tcp),
            PROTO_UDP => Ok(Protocol::Udp),
            PROTO_ANY => Ok(Protocol::Any),
            _ => Err(PortMapError::Protocol(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortMapError {
    #[error("invalid port in port map declaration `{0}`")]
    Port(String),
    #[error("unsupported protocol `{0}` in port map declaration")]
    Protocol(String),
}

/// Parse a `<port>/<tcp|udp|*>` declaration. A bare `<port>` means tcp.
pub fn parse_port_map(spec: &str) -> Result<(u16, Protocol), PortMapError> {
    let (port, proto) = match spec.trim().split_once('/') {
        Some((port, proto)) => (port, proto.parse::<Protocol>()?),
        None => (spec.trim(), Protocol::Tcp),
    };

    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok((port, proto)),
        _ => Err(PortMapError::Port(spec.to_string())),
    }
}

/// Render a `<port>/<protocol>` declaration.
pub fn format_port_map(port: u16, proto: Protocol) -> String {
    format!("{}/{}", port, proto)
}

/// Address part of an endpoint: the VIP and its port declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Virtual IP.
    pub ip: String,
    /// External port → `port/protocol`.
    #[serde(default)]
    pub port_map: BTreeMap<u16, String>,
}

/// Desired state of one load-balanced endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointManifest {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    pub spec: EndpointSpec,
    /// Upstream host addresses.
    #[serde(default)]
    pub upstreams: Vec<String>,
}

impl EndpointManifest {
    pub fn new(ip: &str, port_map: BTreeMap<u16, String>, upstreams: Vec<String>) -> Self {
        Self {
            namespace: String::new(),
            name: String::new(),
            spec: EndpointSpec {
                ip: ip.to_string(),
                port_map,
            },
            upstreams,
        }
    }

    /// The manifest that would have produced `state`. Used as a diffing baseline.
    pub fn from_state(state: &EndpointState) -> Self {
        Self {
            namespace: String::new(),
            name: String::new(),
            spec: state.spec.clone(),
            upstreams: state.upstreams.clone(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.spec.ip
    }
}

impl Entity for EndpointManifest {
    const COLLECTION: &'static str = ENDPOINTS;

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn self_link(&self) -> String {
        link(&[&self.namespace, &self.name])
    }

    fn key(&self) -> String {
        registry_key(ENDPOINTS, &[&self.namespace, &self.name])
    }
}

/// Observed state of a VIP, reconstructed from the kernel forwarder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointState {
    pub spec: EndpointSpec,
    /// De-duplicated upstream addresses currently bound.
    #[serde(default)]
    pub upstreams: Vec<String>,
}

impl EndpointState {
    pub fn new(ip: &str) -> Self {
        Self {
            spec: EndpointSpec {
                ip: ip.to_string(),
                port_map: BTreeMap::new(),
            },
            upstreams: Vec::new(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.spec.ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_maps() {
        assert_eq!(parse_port_map("80/tcp"), Ok((80, Protocol::Tcp)));
        assert_eq!(parse_port_map("53/udp"), Ok((53, Protocol::Udp)));
        assert_eq!(parse_port_map("8080/*"), Ok((8080, Protocol::Any)));
        assert_eq!(parse_port_map("443/TCP"), Ok((443, Protocol::Tcp)));
        assert_eq!(parse_port_map("9000"), Ok((9000, Protocol::Tcp)));
    }

    #[test]
    fn rejects_malformed_port_maps() {
        assert!(matches!(parse_port_map("http/tcp"), Err(PortMapError::Port(_))));
        assert!(matches!(parse_port_map("0/tcp"), Err(PortMapError::Port(_))));
        assert!(matches!(parse_port_map("70000/udp"), Err(PortMapError::Port(_))));
        assert!(matches!(parse_port_map("80/sctp"), Err(PortMapError::Protocol(_))));
        assert!(parse_port_map("").is_err());
    }

    #[test]
    fn formats_port_maps() {
        assert_eq!(format_port_map(80, Protocol::Any), "80/*");
        assert_eq!(format_port_map(53, Protocol::Udp), "53/udp");
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let mut port_map = BTreeMap::new();
        port_map.insert(8080, "80/tcp".to_string());
        let manifest = EndpointManifest::new("10.96.0.10", port_map, vec!["10.0.0.1".into()]);

        let json = serde_json::to_string(&manifest).unwrap();
        let back: EndpointManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
