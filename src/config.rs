//! Bridge configuration files.
//!
//! The library core never reads files; this module is for the binary and
//! other callers that keep the forwarding table on disk.

use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::forward::PortForward;
use crate::network::NetworkConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub forwards: Vec<PortForward>,
    /// Address host listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Guest agent control socket
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            forwards: Vec::new(),
            bind_address: default_bind_address(),
            control_socket: None,
        }
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl BridgeConfig {
    pub fn enabled_forwards(&self) -> impl Iterator<Item = &PortForward> {
        self.forwards.iter().filter(|f| f.enabled)
    }
}

/// Read, parse and validate a YAML (or JSON, by extension) config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let config: BridgeConfig = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    } else {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &BridgeConfig) -> Result<()> {
    config.network.validate()?;

    let mut enabled_ports = HashSet::new();
    for forward in &config.forwards {
        forward.validate()?;
        if forward.enabled && !enabled_ports.insert(forward.host_port) {
            return Err(Error::Config(format!(
                "host port {} is forwarded more than once",
                forward.host_port
            )));
        }
    }

    if let Some(socket) = &config.control_socket {
        if socket.as_os_str().is_empty() {
            return Err(Error::Config("control_socket cannot be empty".into()));
        }
    }

    Ok(())
}
