//! Configuration system for the relaymesh CLI.

use relaymesh_core::{Address, PeerId};
use relaymesh_discovery::PeerRecord;
use relaymesh_discovery::nat::external::PUBLIC_STUN_SERVERS;
use relaymesh_discovery::nat::get_addrs;
use relaymesh_relay::webrtc::TcpChannelConfig;
use relaymesh_relay::{RelayConfig, WebRtcConfig};
use relaymesh_transport::NodeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// relaymesh configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeSection,
    /// Sockets and address discovery
    #[serde(default)]
    pub network: NetworkSection,
    /// Entry nodes
    #[serde(default)]
    pub entry: EntrySection,
    /// Relay service
    #[serde(default)]
    pub relay: RelaySection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Private key file path
    #[serde(default = "default_private_key_path")]
    pub private_key_file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// STUN servers as `host:port`, asked when entry nodes do not answer
    #[serde(default)]
    pub stun_servers: Vec<String>,
    /// Fall back to well-known public STUN servers if `stun_servers` is empty
    #[serde(default = "default_true")]
    pub use_public_stun: bool,
    /// Accept private and loopback STUN results
    #[serde(default)]
    pub running_locally: bool,
    /// Advertise private IPv4 interface addresses
    #[serde(default = "default_true")]
    pub include_private: bool,
    /// Advertise loopback interface addresses
    #[serde(default = "default_true")]
    pub include_localhost: bool,
}

/// A configured entry node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedNode {
    /// Peer id (hex public key)
    pub id: String,
    /// Addresses such as `/ip4/203.0.113.7/tcp/9091`
    pub addresses: Vec<String>,
}

/// Entry node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySection {
    /// Known entry nodes
    #[serde(default)]
    pub seed_nodes: Vec<SeedNode>,
    /// Maximum number of used relays
    #[serde(default = "default_max_relays")]
    pub max_relays: usize,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Circuits forwarded at most in relay mode
    #[serde(default = "default_max_relayed_connections")]
    pub max_relayed_connections: usize,
    /// Circuit setup timeout in milliseconds
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,
    /// Upgrade relayed connections to direct channels
    #[serde(default = "default_true")]
    pub direct_upgrade: bool,
    /// Direct channel setup timeout in milliseconds
    #[serde(default = "default_upgrade_timeout_ms")]
    pub upgrade_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level or `tracing` filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_private_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".relaymesh/private_key")
}

fn default_listen_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_relays() -> usize {
    relaymesh_discovery::entry::MAX_RELAYS_PER_NODE
}

fn default_max_relayed_connections() -> usize {
    10
}

fn default_circuit_timeout_ms() -> u64 {
    6_000
}

fn default_upgrade_timeout_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            private_key_file: default_private_key_path(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            stun_servers: Vec::new(),
            use_public_stun: true,
            running_locally: false,
            include_private: true,
            include_localhost: true,
        }
    }
}

impl Default for EntrySection {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            max_relays: default_max_relays(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_relayed_connections: default_max_relayed_connections(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
            direct_upgrade: true,
            upgrade_timeout_ms: default_upgrade_timeout_ms(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("relaymesh/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Parse the configured entry nodes
    ///
    /// # Errors
    ///
    /// Returns an error if an id or address cannot be parsed.
    pub fn seed_nodes(&self) -> anyhow::Result<Vec<PeerRecord>> {
        self.entry
            .seed_nodes
            .iter()
            .map(|seed| {
                let id: PeerId = seed
                    .id
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Seed node '{}': {}", seed.id, e))?;
                let addresses = seed
                    .addresses
                    .iter()
                    .map(|addr| addr.parse::<Address>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PeerRecord { id, addresses })
            })
            .collect()
    }

    /// STUN servers asked when entry nodes do not answer
    #[must_use]
    pub fn fallback_stun_servers(&self) -> Vec<String> {
        if !self.network.stun_servers.is_empty() {
            self.network.stun_servers.clone()
        } else if self.network.use_public_stun {
            PUBLIC_STUN_SERVERS.iter().map(ToString::to_string).collect()
        } else {
            Vec::new()
        }
    }

    /// Map onto the library configuration. Without `relay_mode` the node
    /// refuses to forward circuits for others.
    ///
    /// # Errors
    ///
    /// Returns an error if a seed node cannot be parsed.
    pub fn node_config(&self, relay_mode: bool) -> anyhow::Result<NodeConfig> {
        let mut node = NodeConfig::default();

        node.listener.interfaces.include_private_ipv4 = self.network.include_private;
        node.listener.interfaces.include_localhost_ipv4 = self.network.include_localhost;
        node.listener.external.fallback_servers = self.fallback_stun_servers();
        node.listener.external.running_locally = self.network.running_locally;

        node.entry.seed_nodes = self.seed_nodes()?;
        node.entry.max_relays = self.entry.max_relays;

        // Direct channel candidates are the advertised interface addresses
        let candidate_ips: Vec<IpAddr> = if self.relay.direct_upgrade {
            get_addrs(0, &node.listener.interfaces)?
                .iter()
                .filter_map(|addr| addr.socket_addr().map(|sa| sa.ip()))
                .collect()
        } else {
            Vec::new()
        };

        node.relay = RelayConfig {
            max_relayed_connections: if relay_mode {
                self.relay.max_relayed_connections
            } else {
                0
            },
            circuit_timeout: Duration::from_millis(self.relay.circuit_timeout_ms),
            webrtc: self.relay.direct_upgrade.then(|| WebRtcConfig {
                upgrade_timeout: Duration::from_millis(self.relay.upgrade_timeout_ms),
                channel: TcpChannelConfig {
                    candidate_ips: candidate_ips.clone(),
                    ..TcpChannelConfig::default()
                },
            }),
            ..RelayConfig::default()
        };

        Ok(node)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.entry.max_relays == 0 {
            anyhow::bail!("Max relays must be at least 1");
        }

        if self.relay.max_relayed_connections > 10_000 {
            anyhow::bail!("Max relayed connections must be at most 10000");
        }

        if self.relay.circuit_timeout_ms == 0 || self.relay.upgrade_timeout_ms == 0 {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        for server in &self.network.stun_servers {
            validate_host_port(server, "STUN server")?;
        }

        self.seed_nodes()?;
        Ok(())
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("{} '{}' missing port (expected format: host:port)", name, addr);
    };

    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port))?;
    if port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }
    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_addr, "0.0.0.0:9091");
        assert_eq!(config.entry.max_relays, 5);
        assert_eq!(config.relay.max_relayed_connections, 10);
        assert!(config.relay.direct_upgrade);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.network.stun_servers = vec!["stun.example.org".to_string()];
        assert!(config.validate().is_err());
        config.network.stun_servers = vec!["stun.example.org:3478".to_string()];
        assert!(config.validate().is_ok());

        config.entry.seed_nodes = vec![SeedNode {
            id: "not-hex".to_string(),
            addresses: Vec::new(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_config_mapping() {
        let seed = PeerId::random();
        let mut config = Config::default();
        config.entry.seed_nodes = vec![SeedNode {
            id: seed.to_string(),
            addresses: vec!["/ip4/203.0.113.7/tcp/9091".to_string()],
        }];
        config.relay.direct_upgrade = false;

        let node = config.node_config(false).unwrap();
        assert_eq!(node.relay.max_relayed_connections, 0);
        assert!(node.relay.webrtc.is_none());
        assert_eq!(node.entry.seed_nodes.len(), 1);
        assert_eq!(node.entry.seed_nodes[0].id, seed);
        assert_eq!(
            node.listener.external.fallback_servers.len(),
            PUBLIC_STUN_SERVERS.len()
        );

        let relay = config.node_config(true).unwrap();
        assert_eq!(relay.relay.max_relayed_connections, 10);
    }

    #[test]
    fn test_stun_server_override() {
        let mut config = Config::default();
        config.network.use_public_stun = false;
        assert!(config.fallback_stun_servers().is_empty());

        config.network.stun_servers = vec!["127.0.0.1:3478".to_string()];
        assert_eq!(config.fallback_stun_servers(), vec!["127.0.0.1:3478"]);
    }

    #[test]
    fn test_toml_serialization() {
        let mut config = Config::default();
        config.entry.seed_nodes = vec![SeedNode {
            id: PeerId::random().to_string(),
            addresses: vec!["/ip4/10.0.0.1/tcp/9091".to_string()],
        }];
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.network.listen_addr, deserialized.network.listen_addr);
        assert_eq!(config.entry.seed_nodes, deserialized.entry.seed_nodes);
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str("[relay]\nmax_relayed_connections = 3\n").unwrap();
        assert_eq!(config.relay.max_relayed_connections, 3);
        assert_eq!(config.relay.circuit_timeout_ms, 6_000);
        assert_eq!(config.network.listen_addr, "0.0.0.0:9091");
    }
}
