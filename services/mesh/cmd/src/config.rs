//! Configuration handling for the hopmesh node.
//!
//! Values are read from an optional YAML file, then overridden by
//! `HOPMESH_*` environment variables. Command-line flags are applied last by
//! the caller.

use anyhow::{Context, Result};
use mesh_routing::RouterConfig;
use mesh_wire::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Prefix of every environment override
const ENV_PREFIX: &str = "HOPMESH_";

/// A peer reachable at a fixed TCP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPeer {
    /// Identifier the peer advertises
    pub id: PeerId,
    /// TCP endpoint
    pub addr: SocketAddr,
    /// Link cost, the node's `link_cost` when absent
    #[serde(default)]
    pub cost: Option<u32>,
}

impl FromStr for StaticPeer {
    type Err = anyhow::Error;

    /// Parse `<id>@<addr>` or `<id>@<addr>/<cost>`
    fn from_str(s: &str) -> Result<Self> {
        let (id, rest) = s
            .split_once('@')
            .with_context(|| format!("expected <id>@<addr>[/<cost>], got {:?}", s))?;
        let (addr, cost) = match rest.split_once('/') {
            Some((addr, cost)) => (addr, Some(cost.parse().context("invalid link cost")?)),
            None => (rest, None),
        };
        Ok(Self {
            id: id.parse().context("invalid peer id")?,
            addr: addr.parse().context("invalid peer address")?,
            cost,
        })
    }
}

impl fmt::Display for StaticPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)?;
        if let Some(cost) = self.cost {
            write!(f, "/{}", cost)?;
        }
        Ok(())
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node, random when absent
    pub node_id: Option<PeerId>,
    /// Human readable name sent in link handshakes
    pub node_name: String,
    /// TCP address to accept connections on
    pub listen: SocketAddr,
    /// Cost of links to static peers without their own cost
    pub link_cost: u32,
    /// Statically configured peers
    pub peers: Vec<StaticPeer>,
    /// How often static peers are announced again
    #[serde(with = "duration_str")]
    pub announce_interval: Duration,
    /// Delay of the link-state broadcast after a topology change
    #[serde(with = "duration_str")]
    pub broadcast_short_delay: Duration,
    /// Interval of the periodic link-state broadcast
    #[serde(with = "duration_str")]
    pub broadcast_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_name: "hopmesh".to_string(),
            listen: SocketAddr::from(([0, 0, 0, 0], 7420)),
            link_cost: 1,
            peers: Vec::new(),
            announce_interval: Duration::from_secs(30),
            broadcast_short_delay: Duration::from_secs(5),
            broadcast_interval: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file yields the defaults; a file that fails to parse is an
    /// error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file {:?}", path));
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `HOPMESH_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    /// Apply overrides from a key lookup. Invalid values are logged and
    /// ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("NODE_ID") {
            match value.parse() {
                Ok(id) => {
                    self.node_id = Some(id);
                    info!("Node ID overridden by environment: {}", value);
                }
                Err(e) => warn!("Ignoring {}NODE_ID={:?}: {}", ENV_PREFIX, value, e),
            }
        }

        if let Some(name) = lookup("NODE_NAME") {
            info!("Node name overridden by environment: {}", name);
            self.node_name = name;
        }

        if let Some(value) = lookup("LISTEN") {
            match value.parse() {
                Ok(listen) => {
                    self.listen = listen;
                    info!("Listen address overridden by environment: {}", listen);
                }
                Err(e) => warn!("Ignoring {}LISTEN={:?}: {}", ENV_PREFIX, value, e),
            }
        }

        if let Some(value) = lookup("LINK_COST") {
            match value.parse() {
                Ok(cost) => {
                    self.link_cost = cost;
                    info!("Link cost overridden by environment: {}", cost);
                }
                Err(e) => warn!("Ignoring {}LINK_COST={:?}: {}", ENV_PREFIX, value, e),
            }
        }

        if let Some(value) = lookup("PEERS") {
            let parsed: Result<Vec<StaticPeer>> = value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(peers) => {
                    info!("{} static peers set by environment", peers.len());
                    self.peers = peers;
                }
                Err(e) => warn!("Ignoring {}PEERS: {:#}", ENV_PREFIX, e),
            }
        }

        for (key, target) in [
            ("ANNOUNCE_INTERVAL", &mut self.announce_interval),
            ("BROADCAST_SHORT_DELAY", &mut self.broadcast_short_delay),
            ("BROADCAST_INTERVAL", &mut self.broadcast_interval),
        ] {
            if let Some(value) = lookup(key) {
                match humantime::parse_duration(&value) {
                    Ok(duration) => *target = duration,
                    Err(e) => warn!("Ignoring {}{}={:?}: {}", ENV_PREFIX, key, value, e),
                }
            }
        }
    }

    /// Cost of the link to a static peer
    pub fn cost_of(&self, peer: &StaticPeer) -> u32 {
        peer.cost.unwrap_or(self.link_cost)
    }

    /// Router settings for a node with identifier `id`
    pub fn router_config(&self, id: PeerId) -> RouterConfig {
        let mut config = RouterConfig::new(id, self.node_name.clone());
        config.broadcast_short_delay = self.broadcast_short_delay;
        config.broadcast_interval = self.broadcast_interval;
        config.default_link_cost = self.link_cost;
        config
    }
}

/// Durations written the humantime way, e.g. `5s` or `1m 30s`
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.node_id.is_none());
        assert_eq!(config.listen.port(), 7420);
        assert_eq!(config.link_cost, 1);
        assert_eq!(config.broadcast_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node_id: 00000000-0000-0000-0000-000000000001
node_name: alpha
listen: 127.0.0.1:9100
broadcast_short_delay: 500ms
peers:
  - id: 00000000-0000-0000-0000-000000000002
    addr: 127.0.0.1:9200
  - id: 00000000-0000-0000-0000-000000000003
    addr: 127.0.0.1:9300
    cost: 4
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.node_id, Some(PeerId::from_u128(1)));
        assert_eq!(config.node_name, "alpha");
        assert_eq!(config.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.broadcast_short_delay, Duration::from_millis(500));
        // Unset values keep their defaults
        assert_eq!(config.broadcast_interval, Duration::from_secs(60));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.cost_of(&config.peers[0]), 1);
        assert_eq!(config.cost_of(&config.peers[1]), 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.node_name, "hopmesh");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"listen: [not, an, address]\n").unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NODE_ID", "00000000-0000-0000-0000-000000000007"),
            ("LINK_COST", "not-a-number"),
            (
                "PEERS",
                "00000000-0000-0000-0000-000000000002@10.0.0.2:7420/3, \
                 00000000-0000-0000-0000-000000000003@10.0.0.3:7420",
            ),
            ("BROADCAST_INTERVAL", "2m"),
        ]);
        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.node_id, Some(PeerId::from_u128(7)));
        assert_eq!(config.link_cost, 1);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].cost, Some(3));
        assert_eq!(config.peers[1].addr, "10.0.0.3:7420".parse().unwrap());
        assert_eq!(config.broadcast_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_static_peer_syntax() {
        let peer: StaticPeer = "00000000-0000-0000-0000-000000000002@127.0.0.1:1/9"
            .parse()
            .unwrap();
        assert_eq!(peer.to_string(), "00000000-0000-0000-0000-000000000002@127.0.0.1:1/9");
        assert!("127.0.0.1:1".parse::<StaticPeer>().is_err());
        assert!("00000000-0000-0000-0000-000000000002@nowhere".parse::<StaticPeer>().is_err());
    }

    #[test]
    fn test_router_config() {
        let mut config = NodeConfig::default();
        config.node_name = "beta".to_string();
        config.link_cost = 5;
        let router = config.router_config(PeerId::from_u128(3));
        assert_eq!(router.local_name, "beta");
        assert_eq!(router.default_link_cost, 5);
        assert_eq!(router.broadcast_short_delay, Duration::from_secs(5));
    }
}
