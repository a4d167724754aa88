//! Node configuration (spec.md §2 ambient stack): identity, peers, consensus
//! timing, storage, metrics, crypto, logging, plus the reconfiguration
//! ceremony timeouts the teacher's `config/mod.rs` has no equivalent for.
//! Grounded on the teacher's `NodeConfig`/`ConsensusConfig`/`NetworkConfig`/
//! `StorageConfig`/`MetricsConfig`/`CryptoConfig`/`LoggingConfig` layering and
//! its `load_from_file`/`save_to_file`/`validate` shape, generalized from the
//! teacher's fixed single protocol to the four-way `ConsensusKind` this crate
//! dispatches on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrdererError, Result};
use crate::protocol::ConsensusKind;
use crate::types::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: String,
    pub peers: Vec<PeerConfig>,

    pub consensus: ConsensusConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
    pub crypto: CryptoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub address: String,
}

/// Which protocol the `-pr` CLI flag names, plus the timing the pacemaker
/// and node-management ceremony both need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub protocol: ConsensusFlag,
    pub batch_size: usize,

    pub base_timeout_ms: u64,
    pub timeout_multiplier: f64,
    pub max_view_changes: u64,

    /// Timeout for the three-step JOIN/EXIT ceremony (spec.md §4.11):
    /// how long a requester waits for `SYNC`/`AGREE`/`RESTART` before
    /// retrying the `APPLY` broadcast.
    pub reconfig_timeout_ms: u64,
}

/// Serde-friendly mirror of `ConsensusKind` (`ConsensusKind` itself carries
/// no `Serialize`/`Deserialize` since nothing but config needs it on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusFlag {
    #[serde(rename = "bh")]
    BasicHotStuff,
    #[serde(rename = "ch")]
    ChainedHotStuff,
    #[serde(rename = "h2")]
    HotStuff2,
    #[serde(rename = "pbft")]
    Pbft,
}

impl ConsensusFlag {
    pub fn as_kind(self) -> ConsensusKind {
        match self {
            ConsensusFlag::BasicHotStuff => ConsensusKind::BasicHotStuff,
            ConsensusFlag::ChainedHotStuff => ConsensusKind::ChainedHotStuff,
            ConsensusFlag::HotStuff2 => ConsensusKind::HotStuff2,
            ConsensusFlag::Pbft => ConsensusKind::Pbft,
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "bh" => Some(Self::BasicHotStuff),
            "ch" => Some(Self::ChainedHotStuff),
            "h2" => Some(Self::HotStuff2),
            "pbft" => Some(Self::Pbft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub max_peers: usize,
    pub connection_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub sync_writes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Threshold for the HotStuff-family threshold signer; unused for PBFT,
    /// which signs votes with the plain identity key instead.
    pub threshold: Option<usize>,
    pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from_index(0),
            listen_addr: "127.0.0.1:8000".to_string(),
            peers: Vec::new(),
            consensus: ConsensusConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
            crypto: CryptoConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            protocol: ConsensusFlag::ChainedHotStuff,
            batch_size: 100,
            base_timeout_ms: 1000,
            timeout_multiplier: 1.5,
            max_view_changes: 10,
            reconfig_timeout_ms: 5000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_peers: 100,
            connection_timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sync_writes: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_port: 9091,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            threshold: None,
            private_key_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl NodeConfig {
    /// Loads from TOML if the extension says so, JSON otherwise.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension() == Some(std::ffi::OsStr::new("toml")) {
            toml::from_str(&content)
                .map_err(|e| OrdererError::Configuration(format!("failed to parse TOML config: {e}")))
        } else {
            serde_json::from_str(&content).map_err(OrdererError::from)
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if path.extension() == Some(std::ffi::OsStr::new("toml")) {
            toml::to_string_pretty(self)
                .map_err(|e| OrdererError::Configuration(format!("failed to serialize TOML config: {e}")))?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks the BFT arithmetic (`n >= 3f + 1` with `f` derived from the
    /// node count) and the threshold setting when one is configured.
    pub fn validate(&self) -> Result<()> {
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(OrdererError::Configuration(
                "node_id cannot appear in its own peers list".to_string(),
            ));
        }

        let total_nodes = self.total_nodes();
        if total_nodes < 4 {
            return Err(OrdererError::Configuration(format!(
                "need at least 4 nodes to tolerate any Byzantine fault, have {total_nodes}"
            )));
        }

        if let Some(threshold) = self.crypto.threshold {
            if threshold == 0 || threshold > total_nodes {
                return Err(OrdererError::InvalidThreshold(threshold, total_nodes));
            }
        }

        Ok(())
    }

    pub fn total_nodes(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus.base_timeout_ms)
    }

    pub fn reconfig_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus.reconfig_timeout_ms)
    }

    pub fn default_for_testing() -> Self {
        let mut config = Self::default();
        config.storage.data_dir = std::env::temp_dir().join("bft-orderer-test");
        config.consensus.base_timeout_ms = 200;
        config.consensus.reconfig_timeout_ms = 500;
        config
    }

    pub fn default_for_testing_with_id(index: u32) -> Self {
        let mut config = Self::default_for_testing();
        config.node_id = NodeId::from_index(index);
        config.listen_addr = format!("127.0.0.1:{}", 8000 + index);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(index: u32) -> PeerConfig {
        PeerConfig { node_id: NodeId::from_index(index), address: format!("127.0.0.1:{}", 8000 + index) }
    }

    #[test]
    fn validate_rejects_self_in_peer_list() {
        let mut config = NodeConfig::default_for_testing_with_id(0);
        config.peers = vec![peer(0), peer(1), peer(2)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_too_few_nodes() {
        let mut config = NodeConfig::default_for_testing_with_id(0);
        config.peers = vec![peer(1)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_four_node_cluster() {
        let mut config = NodeConfig::default_for_testing_with_id(0);
        config.peers = vec![peer(1), peer(2), peer(3)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut config = NodeConfig::default_for_testing_with_id(0);
        config.peers = vec![peer(1), peer(2), peer(3)];
        config.crypto.threshold = Some(9);
        assert!(matches!(config.validate(), Err(OrdererError::InvalidThreshold(9, 4))));
    }

    #[test]
    fn consensus_flag_round_trips_through_from_flag() {
        assert_eq!(ConsensusFlag::from_flag("h2"), Some(ConsensusFlag::HotStuff2));
        assert_eq!(ConsensusFlag::from_flag("bogus"), None);
    }
}
