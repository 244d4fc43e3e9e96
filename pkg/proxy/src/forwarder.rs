use async_trait::async_trait;
use pkg_constants::network::{DESTINATION_WEIGHT, IPVS_MODULE, IPVS_SCHEDULER};
use pkg_constants::paths::{IPVSADM_BIN, MODPROBE_BIN};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use tokio::sync::Mutex;

use crate::command::{failed_with, run};
use crate::error::ProxyError;
use crate::rules::{Destination, L4Protocol, VirtualService, destination_key};

/// Kernel L4 forwarding capability.
///
/// Creating something that already exists and deleting something that is
/// already gone both succeed, so compensating and repeated calls are safe.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Make sure the forwarding subsystem is available (kernel module loaded).
    async fn ensure_module(&self) -> Result<(), ProxyError>;

    async fn new_service(&self, service: &VirtualService) -> Result<(), ProxyError>;

    async fn del_service(&self, service: &VirtualService) -> Result<(), ProxyError>;

    async fn services(&self) -> Result<Vec<VirtualService>, ProxyError>;

    async fn new_destination(
        &self,
        service: &VirtualService,
        destination: &Destination,
    ) -> Result<(), ProxyError>;

    async fn del_destination(
        &self,
        service: &VirtualService,
        destination: &Destination,
    ) -> Result<(), ProxyError>;

    async fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>, ProxyError>;
}

// ─── ipvsadm backend ────────────────────────────────────────────

/// Drives the kernel IPVS tables through the `ipvsadm` tool.
/// Destinations are added in masquerading (NAT) mode.
pub struct Ipvsadm {
    bin: String,
}

impl Default for Ipvsadm {
    fn default() -> Self {
        Self::new(IPVSADM_BIN)
    }
}

impl Ipvsadm {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn service_args(flag: &str, service: &VirtualService) -> Vec<String> {
        vec![
            flag.to_string(),
            protocol_flag(service.protocol).to_string(),
            service.endpoint(),
        ]
    }

    async fn mutate(&self, args: Vec<String>, tolerated: &[&str]) -> Result<(), ProxyError> {
        match run(&self.bin, &args).await {
            Ok(_) => Ok(()),
            Err(e) if failed_with(&e, tolerated) => {
                tracing::debug!("ipvsadm {}: already in desired state", args.join(" "));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn protocol_flag(protocol: L4Protocol) -> &'static str {
    match protocol {
        L4Protocol::Tcp => "-t",
        L4Protocol::Udp => "-u",
    }
}

const ALREADY_EXISTS: &[&str] = &["already exists"];
const NO_SUCH: &[&str] = &["no such"];

#[async_trait]
impl Forwarder for Ipvsadm {
    async fn ensure_module(&self) -> Result<(), ProxyError> {
        let args = vec!["-va".to_string(), IPVS_MODULE.to_string()];
        run(MODPROBE_BIN, &args)
            .await
            .map(|_| ())
            .map_err(|e| ProxyError::ModuleLoad {
                module: IPVS_MODULE.to_string(),
                message: e.to_string(),
            })
    }

    async fn new_service(&self, service: &VirtualService) -> Result<(), ProxyError> {
        let mut args = Self::service_args("-A", service);
        args.extend(["-s".to_string(), service.scheduler.clone()]);
        self.mutate(args, ALREADY_EXISTS).await
    }

    async fn del_service(&self, service: &VirtualService) -> Result<(), ProxyError> {
        self.mutate(Self::service_args("-D", service), NO_SUCH).await
    }

    async fn services(&self) -> Result<Vec<VirtualService>, ProxyError> {
        let args = vec!["-Ln".to_string(), "--exact".to_string()];
        let out = run(&self.bin, &args).await?;
        Ok(parse_table(&out)?
            .into_iter()
            .map(|(service, _)| service)
            .collect())
    }

    async fn new_destination(
        &self,
        service: &VirtualService,
        destination: &Destination,
    ) -> Result<(), ProxyError> {
        let mut args = Self::service_args("-a", service);
        args.extend([
            "-r".to_string(),
            destination.endpoint(),
            "-m".to_string(),
            "-w".to_string(),
            destination.weight.to_string(),
        ]);
        self.mutate(args, ALREADY_EXISTS).await
    }

    async fn del_destination(
        &self,
        service: &VirtualService,
        destination: &Destination,
    ) -> Result<(), ProxyError> {
        let mut args = Self::service_args("-d", service);
        args.extend(["-r".to_string(), destination.endpoint()]);
        self.mutate(args, NO_SUCH).await
    }

    async fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>, ProxyError> {
        let mut args = Self::service_args("-L", service);
        args.extend(["-n".to_string(), "--exact".to_string()]);
        let out = run(&self.bin, &args).await?;
        Ok(parse_table(&out)?
            .into_iter()
            .find(|(listed, _)| {
                listed.address == service.address
                    && listed.port == service.port
                    && listed.protocol == service.protocol
            })
            .map(|(_, destinations)| destinations)
            .unwrap_or_default())
    }
}

fn parse_socket(value: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.parse().ok()?, port.parse().ok()?))
}

/// Parse `ipvsadm -Ln --exact` output into services and their destinations.
///
/// ```text
/// IP Virtual Server version 1.2.1 (size=4096)
/// Prot LocalAddress:Port Scheduler Flags
///   -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
/// TCP  10.96.0.10:8080 rr
///   -> 10.0.0.1:80                  Masq    1      0          0
/// ```
///
/// Firewall-mark services are skipped.
pub fn parse_table(output: &str) -> Result<Vec<(VirtualService, Vec<Destination>)>, ProxyError> {
    let bad = |line: &str| ProxyError::Parse {
        command: format!("{} -Ln --exact", IPVSADM_BIN),
        line: line.to_string(),
    };

    let mut table: Vec<(VirtualService, Vec<Destination>)> = Vec::new();
    let mut in_fwmark = false;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => continue,
            ["IP", "Virtual", ..] | ["Prot", ..] | ["->", "RemoteAddress:Port", ..] => continue,
            ["FWM", ..] => in_fwmark = true,
            [proto @ ("TCP" | "UDP"), socket, rest @ ..] => {
                in_fwmark = false;
                let (address, port) = parse_socket(socket).ok_or_else(|| bad(line))?;
                let protocol = if *proto == "TCP" {
                    L4Protocol::Tcp
                } else {
                    L4Protocol::Udp
                };
                let mut service = VirtualService::new(address, port, protocol);
                service.scheduler = rest
                    .first()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| IPVS_SCHEDULER.to_string());
                table.push((service, Vec::new()));
            }
            ["->", socket, rest @ ..] => {
                if in_fwmark {
                    continue;
                }
                let (address, port) = parse_socket(socket).ok_or_else(|| bad(line))?;
                let weight = rest
                    .get(1)
                    .and_then(|w| w.parse().ok())
                    .unwrap_or(DESTINATION_WEIGHT);
                let (_, destinations) = table.last_mut().ok_or_else(|| bad(line))?;
                destinations.push(Destination {
                    address,
                    port,
                    weight,
                });
            }
            _ => return Err(bad(line)),
        }
    }

    Ok(table)
}

// ─── In-memory backend ──────────────────────────────────────────

/// A forwarding-table mutation recorded by [`MemoryForwarder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    NewService(VirtualService),
    DelService(VirtualService),
    NewDestination(VirtualService, Destination),
    DelDestination(VirtualService, Destination),
}

type ServiceId = (IpAddr, u16, L4Protocol);

fn service_id(service: &VirtualService) -> ServiceId {
    (service.address, service.port, service.protocol)
}

#[derive(Default)]
struct Tables {
    services: BTreeMap<ServiceId, (VirtualService, BTreeMap<String, Destination>)>,
    mutations: Vec<Mutation>,
    rejected: HashSet<IpAddr>,
    module_fails: bool,
    listing_fails: bool,
}

impl Tables {
    fn check(&self, addresses: &[IpAddr], command: &str) -> Result<(), ProxyError> {
        match addresses.iter().find(|a| self.rejected.contains(a)) {
            Some(address) => Err(ProxyError::Command {
                command: command.to_string(),
                message: format!("address {} rejected", address),
            }),
            None => Ok(()),
        }
    }
}

/// Forwarding tables held in memory. Used for dry runs and tests; every
/// mutation call is recorded in order.
#[derive(Default)]
pub struct MemoryForwarder {
    tables: Mutex<Tables>,
}

impl MemoryForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every later mutation that touches `address`.
    pub async fn reject_address(&self, address: IpAddr) {
        self.tables.lock().await.rejected.insert(address);
    }

    /// Make `ensure_module` fail while `fail` is set.
    pub async fn fail_module(&self, fail: bool) {
        self.tables.lock().await.module_fails = fail;
    }

    /// Make `services` fail while `fail` is set.
    pub async fn fail_listing(&self, fail: bool) {
        self.tables.lock().await.listing_fails = fail;
    }

    pub async fn mutations(&self) -> Vec<Mutation> {
        self.tables.lock().await.mutations.clone()
    }

    pub async fn clear_mutations(&self) {
        self.tables.lock().await.mutations.clear();
    }
}

#[async_trait]
impl Forwarder for MemoryForwarder {
    async fn ensure_module(&self) -> Result<(), ProxyError> {
        if self.tables.lock().await.module_fails {
            return Err(ProxyError::ModuleLoad {
                module: IPVS_MODULE.to_string(),
                message: "module not available".to_string(),
            });
        }
        Ok(())
    }

    async fn new_service(&self, service: &VirtualService) -> Result<(), ProxyError> {
        let mut tables = self.tables.lock().await;
        tables.mutations.push(Mutation::NewService(service.clone()));
        tables.check(&[service.address], "new_service")?;
        tables
            .services
            .entry(service_id(service))
            .or_insert_with(|| (service.clone(), BTreeMap::new()));
        Ok(())
    }

    async fn del_service(&self, service: &VirtualService) -> Result<(), ProxyError> {
        let mut tables = self.tables.lock().await;
        tables.mutations.push(Mutation::DelService(service.clone()));
        tables.check(&[service.address], "del_service")?;
        tables.services.remove(&service_id(service));
        Ok(())
    }

    async fn services(&self) -> Result<Vec<VirtualService>, ProxyError> {
        let tables = self.tables.lock().await;
        if tables.listing_fails {
            return Err(ProxyError::Command {
                command: "services".to_string(),
                message: "listing failed".to_string(),
            });
        }
        Ok(tables.services.values().map(|(s, _)| s.clone()).collect())
    }

    async fn new_destination(
        &self,
        service: &VirtualService,
        destination: &Destination,
    ) -> Result<(), ProxyError> {
        let mut tables = self.tables.lock().await;
        tables
            .mutations
            .push(Mutation::NewDestination(service.clone(), destination.clone()));
        tables.check(&[service.address, destination.address], "new_destination")?;
        let (_, destinations) =
            tables
                .services
                .get_mut(&service_id(service))
                .ok_or_else(|| ProxyError::Command {
                    command: "new_destination".to_string(),
                    message: format!("no such service {}", service.endpoint()),
                })?;
        destinations.insert(
            destination_key(destination.address, destination.port),
            destination.clone(),
        );
        Ok(())
    }

    async fn del_destination(
        &self,
        service: &VirtualService,
        destination: &Destination,
    ) -> Result<(), ProxyError> {
        let mut tables = self.tables.lock().await;
        tables
            .mutations
            .push(Mutation::DelDestination(service.clone(), destination.clone()));
        tables.check(&[service.address, destination.address], "del_destination")?;
        if let Some((_, destinations)) = tables.services.get_mut(&service_id(service)) {
            destinations.remove(&destination_key(destination.address, destination.port));
        }
        Ok(())
    }

    async fn destinations(&self, service: &VirtualService) -> Result<Vec<Destination>, ProxyError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .services
            .get(&service_id(service))
            .map(|(_, d)| d.values().cloned().collect())
            .unwrap_or_default())
    }
}
