use async_trait::async_trait;
use pkg_constants::network::VIP_PREFIX_LEN;
use pkg_constants::paths::{IP_BIN, SYS_CLASS_NET};
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::Mutex;

use crate::command::run;
use crate::error::ProxyError;

/// The data-plane network link VIPs are bound to.
#[async_trait]
pub trait Link: Send + Sync {
    fn name(&self) -> &str;

    /// IPv4 addresses currently assigned to the link.
    async fn addresses(&self) -> Result<Vec<Ipv4Addr>, ProxyError>;

    /// Assign `address/32`. Fails if it is already assigned.
    async fn add(&self, address: Ipv4Addr) -> Result<(), ProxyError>;

    /// Remove `address/32`. Fails if it is not assigned.
    async fn del(&self, address: Ipv4Addr) -> Result<(), ProxyError>;
}

fn parse_v4(ip: &str) -> Result<Ipv4Addr, ProxyError> {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        _ => Err(ProxyError::InvalidSpec(format!(
            "`{}` is not an IPv4 address",
            ip
        ))),
    }
}

/// Assign `ip` to `link` unless it is already there.
pub async fn bind_address(link: &dyn Link, ip: &str) -> Result<bool, ProxyError> {
    let address = parse_v4(ip)?;
    if link.addresses().await?.contains(&address) {
        return Ok(false);
    }
    link.add(address).await?;
    tracing::info!("Bound {} to link {}", address, link.name());
    Ok(true)
}

/// Remove `ip` from `link` if it is there.
pub async fn unbind_address(link: &dyn Link, ip: &str) -> Result<bool, ProxyError> {
    let address = parse_v4(ip)?;
    if !link.addresses().await?.contains(&address) {
        return Ok(false);
    }
    link.del(address).await?;
    tracing::info!("Unbound {} from link {}", address, link.name());
    Ok(true)
}

// ─── iproute2 backend ───────────────────────────────────────────

/// A host link managed through the `ip` tool.
pub struct IpLink {
    name: String,
}

impl IpLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The first link (by name) whose name starts with `prefix`.
    pub async fn find(prefix: &str) -> Result<Option<Self>, ProxyError> {
        let mut entries = tokio::fs::read_dir(SYS_CLASS_NET).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names.into_iter().next().map(Self::new))
    }

    fn addr_args(&self, op: &str, address: Ipv4Addr) -> Vec<String> {
        vec![
            "addr".to_string(),
            op.to_string(),
            format!("{}/{}", address, VIP_PREFIX_LEN),
            "dev".to_string(),
            self.name.clone(),
        ]
    }
}

/// Addresses from `ip -o -4 addr show` output.
pub fn parse_addresses(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|f| *f == "inet")?;
            let cidr = fields.next()?;
            cidr.split('/').next()?.parse().ok()
        })
        .collect()
}

#[async_trait]
impl Link for IpLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn addresses(&self) -> Result<Vec<Ipv4Addr>, ProxyError> {
        let args: Vec<String> = ["-o", "-4", "addr", "show", "dev", self.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Ok(parse_addresses(&run(IP_BIN, &args).await?))
    }

    async fn add(&self, address: Ipv4Addr) -> Result<(), ProxyError> {
        run(IP_BIN, &self.addr_args("add", address)).await.map(|_| ())
    }

    async fn del(&self, address: Ipv4Addr) -> Result<(), ProxyError> {
        run(IP_BIN, &self.addr_args("del", address)).await.map(|_| ())
    }
}

// ─── In-memory backend ──────────────────────────────────────────

/// A link whose address list lives in memory. Mirrors the kernel's
/// strictness: adding a present address or removing an absent one fails.
pub struct MemoryLink {
    name: String,
    addresses: Mutex<Vec<Ipv4Addr>>,
}

impl MemoryLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn addresses(&self) -> Result<Vec<Ipv4Addr>, ProxyError> {
        Ok(self.addresses.lock().await.clone())
    }

    async fn add(&self, address: Ipv4Addr) -> Result<(), ProxyError> {
        let mut addresses = self.addresses.lock().await;
        if addresses.contains(&address) {
            return Err(ProxyError::Command {
                command: format!("addr add {} dev {}", address, self.name),
                message: "RTNETLINK answers: File exists".to_string(),
            });
        }
        addresses.push(address);
        Ok(())
    }

    async fn del(&self, address: Ipv4Addr) -> Result<(), ProxyError> {
        let mut addresses = self.addresses.lock().await;
        let Some(pos) = addresses.iter().position(|a| *a == address) else {
            return Err(ProxyError::Command {
                command: format!("addr del {} dev {}", address, self.name),
                message: "RTNETLINK answers: Cannot assign requested address".to_string(),
            });
        };
        addresses.remove(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_twice_leaves_one_address() {
        let link = MemoryLink::new("lb0");
        assert!(bind_address(&link, "10.96.0.10").await.unwrap());
        assert!(!bind_address(&link, "10.96.0.10").await.unwrap());
        assert_eq!(
            link.addresses().await.unwrap(),
            vec!["10.96.0.10".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn unbind_is_idempotent() {
        let link = MemoryLink::new("lb0");
        bind_address(&link, "10.96.0.10").await.unwrap();
        assert!(unbind_address(&link, "10.96.0.10").await.unwrap());
        assert!(!unbind_address(&link, "10.96.0.10").await.unwrap());
        assert!(link.addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_ipv4_is_bound() {
        let link = MemoryLink::new("lb0");
        assert!(matches!(
            bind_address(&link, "fd00::10").await,
            Err(ProxyError::InvalidSpec(_))
        ));
        assert!(bind_address(&link, "nope").await.is_err());
    }

    #[test]
    fn parses_ip_addr_show() {
        let out = "\
4: lb0    inet 10.96.0.10/32 scope global lb0\\       valid_lft forever preferred_lft forever
4: lb0    inet 10.96.0.11/32 scope global lb0\\       valid_lft forever preferred_lft forever
";
        assert_eq!(
            parse_addresses(out),
            vec![
                "10.96.0.10".parse::<Ipv4Addr>().unwrap(),
                "10.96.0.11".parse::<Ipv4Addr>().unwrap()
            ]
        );
        assert!(parse_addresses("").is_empty());
    }
}
