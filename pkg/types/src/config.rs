use serde::{Deserialize, Serialize};

/// Which kernel forwarder backend the proxy drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// IPVS through `ipvsadm` and `ip`.
    #[default]
    Ipvs,
    /// In-memory tables. Nothing touches the host.
    Memory,
}

impl std::str::FromStr for ProxyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipvs" => Ok(ProxyMode::Ipvs),
            "memory" => Ok(ProxyMode::Memory),
            other => Err(anyhow::anyhow!("unknown proxy mode '{}'", other)),
        }
    }
}

/// Daemon configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/lbd/data
/// link-prefix: lb
/// proxy: ipvs
/// endpoints: true
/// log-json: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "link-prefix")]
    pub link_prefix: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyMode>,
    /// Run the endpoint controller that applies stored manifests.
    #[serde(default)]
    pub endpoints: Option<bool>,
    #[serde(default, alias = "log-json")]
    pub log_json: Option<bool>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
