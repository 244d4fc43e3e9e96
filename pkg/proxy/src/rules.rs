use pkg_constants::network::{DESTINATION_WEIGHT, IPVS_SCHEDULER};
use pkg_types::endpoint::{EndpointManifest, Protocol, parse_port_map};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::ProxyError;

/// Transport protocol of a kernel virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl L4Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            L4Protocol::Tcp => "tcp",
            L4Protocol::Udp => "udp",
        }
    }

    /// The declaration-level protocol matching only this one.
    pub fn declared(&self) -> Protocol {
        match self {
            L4Protocol::Tcp => Protocol::Tcp,
            L4Protocol::Udp => Protocol::Udp,
        }
    }
}

impl std::fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kernel forwarding rule matching traffic to `address:port/protocol`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualService {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: L4Protocol,
    pub scheduler: String,
}

impl VirtualService {
    pub fn new(address: IpAddr, port: u16, protocol: L4Protocol) -> Self {
        Self {
            address,
            port,
            protocol,
            scheduler: IPVS_SCHEDULER.to_string(),
        }
    }

    /// `address:port`, bracketing IPv6 addresses.
    pub fn endpoint(&self) -> String {
        socket(self.address, self.port)
    }
}

/// A backend the kernel may route a virtual service's traffic to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
}

impl Destination {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            weight: DESTINATION_WEIGHT,
        }
    }

    pub fn endpoint(&self) -> String {
        socket(self.address, self.port)
    }
}

pub(crate) fn socket(address: IpAddr, port: u16) -> String {
    match address {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}

/// Identity of a virtual service for diffing: `vip_external_internal_proto`.
pub fn service_key(vip: IpAddr, external: u16, internal: u16, protocol: L4Protocol) -> String {
    format!("{}_{}_{}_{}", vip, external, internal, protocol)
}

/// Identity of a destination for diffing: `address_port`.
pub fn destination_key(address: IpAddr, port: u16) -> String {
    format!("{}_{}", address, port)
}

/// One virtual service and the destinations it balances across.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRule {
    pub service: VirtualService,
    /// Keyed by [`destination_key`].
    pub destinations: BTreeMap<String, Destination>,
}

/// The kernel rule set implied by a manifest, keyed by [`service_key`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub services: BTreeMap<String, ServiceRule>,
}

impl RuleSet {
    pub fn get(&self, key: &str) -> Option<&ServiceRule> {
        self.services.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceRule)> {
        self.services.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Distinct destinations across every virtual service.
    pub fn destinations(&self) -> BTreeMap<String, Destination> {
        self.services
            .values()
            .flat_map(|rule| rule.destinations.clone())
            .collect()
    }
}

fn parse_ip(value: &str, what: &str) -> Result<IpAddr, ProxyError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProxyError::InvalidSpec(format!("{} `{}` is not an IP address", what, value)))
}

/// Translate a manifest into the virtual services and destinations it implies.
///
/// Each port map entry yields one virtual service (two for `*`: tcp and
/// udp) with a weight-1 destination per upstream at the internal port.
/// Any malformed declaration fails the whole translation.
pub fn translate(manifest: &EndpointManifest) -> Result<RuleSet, ProxyError> {
    let vip = parse_ip(manifest.ip(), "virtual ip")?;
    let upstreams = manifest
        .upstreams
        .iter()
        .map(|host| parse_ip(host, "upstream"))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rules = RuleSet::default();
    for (&external, declaration) in &manifest.spec.port_map {
        let (internal, protocol) = parse_port_map(declaration)?;

        let destinations: BTreeMap<String, Destination> = upstreams
            .iter()
            .map(|&host| (destination_key(host, internal), Destination::new(host, internal)))
            .collect();

        let protocols: &[L4Protocol] = match protocol {
            Protocol::Tcp => &[L4Protocol::Tcp],
            Protocol::Udp => &[L4Protocol::Udp],
            Protocol::Any => &[L4Protocol::Tcp, L4Protocol::Udp],
        };

        for &proto in protocols {
            rules.services.insert(
                service_key(vip, external, internal, proto),
                ServiceRule {
                    service: VirtualService::new(vip, external, proto),
                    destinations: destinations.clone(),
                },
            );
        }
    }

    Ok(rules)
}
