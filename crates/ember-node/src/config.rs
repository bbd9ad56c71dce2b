//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, used in the client-version string.
    pub node_name: String,
    /// Network identifier; peers on other networks are refused.
    pub network_id: u64,
    /// Network configuration.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Path the live peer list is saved to on shutdown.
    #[serde(default = "default_peers_file")]
    pub peers_file: PathBuf,
}

fn default_peers_file() -> PathBuf {
    PathBuf::from("peers.rlp")
}

/// Network configuration, mirroring the host preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// P2P listen port; 0 picks an ephemeral one.
    pub listen_port: u16,
    /// Operator-declared public IP, empty to autodetect.
    pub public_ip: String,
    /// Attempt a UPnP mapping on startup.
    pub upnp: bool,
    /// Allow private-network peers.
    pub local_networking: bool,
    /// Target live-peer count.
    pub ideal_peer_count: usize,
    /// Bootstrap peers, `host:port`.
    pub bootstrap: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 30303,
            public_ip: String::new(),
            upnp: true,
            local_networking: false,
            ideal_peer_count: 5,
            bootstrap: Vec::new(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "ember".to_string(),
            network_id: 0,
            network: NetworkConfig::default(),
            peers_file: default_peers_file(),
        }
    }
}

impl NodeConfig {
    /// Load from file, then apply CLI overrides.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };

        if let Some(port) = args.listen_port {
            config.network.listen_port = port;
        }
        if let Some(ref ip) = args.public_ip {
            config.network.public_ip = ip.clone();
        }
        if args.no_upnp {
            config.network.upnp = false;
        }
        if args.local {
            config.network.local_networking = true;
        }
        if let Some(ideal) = args.ideal_peers {
            config.network.ideal_peer_count = ideal;
        }
        if let Some(network_id) = args.network_id {
            config.network_id = network_id;
        }
        config.network.bootstrap.extend(args.peer.iter().cloned());
        if let Some(ref path) = args.peers_file {
            config.peers_file = path.clone();
        }

        Ok(config)
    }

    /// Save to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Split a `host:port` bootstrap entry; a bare host gets the default port.
pub fn split_peer_address(entry: &str, default_port: u16) -> (String, u16) {
    match entry.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (entry.to_string(), default_port),
        },
        None => (entry.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network.listen_port, 30303);
        assert_eq!(config.network.ideal_peer_count, 5);
        assert!(config.network.bootstrap.is_empty());
    }

    #[test]
    fn test_split_peer_address() {
        assert_eq!(
            split_peer_address("10.0.0.1:30304", 30303),
            ("10.0.0.1".to_string(), 30304)
        );
        assert_eq!(
            split_peer_address("node.example.com", 30303),
            ("node.example.com".to_string(), 30303)
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let config = NodeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.listen_port, config.network.listen_port);
        assert_eq!(parsed.network_id, config.network_id);
    }
}
