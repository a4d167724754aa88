//! Node entry point (spec.md §6): parses the `-pr`/`-n`/`-pa` CLI flags the
//! wire format names, builds a `Server` from a `NodeConfig`, and runs it
//! until `Ctrl+C`. Grounded on the teacher's `bin/node.rs` argument shape,
//! generalized from its single fixed `HotStuff2` protocol to the `-pr` flag
//! selecting one of the four cores, and from clap's builder API to its
//! derive API (already the dependency this crate carries).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use bft_orderer::config::{ConsensusFlag, NodeConfig, PeerConfig};
use bft_orderer::crypto::IdentitySigner;
use bft_orderer::network::{ServerTransport, TcpTransport};
use bft_orderer::server::{StaticThresholdKeyProvider, ThresholdKeyProvider};
use bft_orderer::types::NodeId;
use bft_orderer::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "bft-node", version, about = "Runs one replica of a permissioned BFT ordering cluster")]
struct Cli {
    /// This replica's index within the cluster (node id is derived as `r_<index>`).
    #[arg(short = 'i', long = "id")]
    id: u32,

    /// Protocol identifier: bh, ch, h2, or pbft.
    #[arg(short = 'r', long = "pr")]
    protocol: String,

    /// Cluster size.
    #[arg(short = 'n', long = "n")]
    cluster_size: u32,

    /// Storage path for this replica's block store.
    #[arg(short = 'a', long = "pa")]
    storage_path: PathBuf,

    /// This replica's listen address, e.g. 127.0.0.1:8000.
    #[arg(short = 'l', long = "listen")]
    listen_addr: SocketAddr,

    /// Comma-separated peer list `index@ip:port`.
    #[arg(short = 'p', long = "peers")]
    peers: String,

    /// Address reserved for client connections.
    #[arg(short = 'c', long = "client")]
    client_addr: SocketAddr,

    /// Request batch size.
    #[arg(short = 'b', long = "batch", default_value_t = 100)]
    batch_size: usize,
}

fn parse_peers(spec: &str) -> Vec<(u32, SocketAddr)> {
    spec.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let (index, addr) = entry.split_once('@')?;
            Some((index.parse().ok()?, addr.parse().ok()?))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let protocol = ConsensusFlag::from_flag(&cli.protocol)
        .ok_or_else(|| format!("unknown protocol flag {:?} (expected bh, ch, h2 or pbft)", cli.protocol))?;

    let peer_entries = parse_peers(&cli.peers);
    let config = NodeConfig {
        node_id: NodeId::from_index(cli.id),
        listen_addr: cli.listen_addr.to_string(),
        peers: peer_entries
            .iter()
            .map(|(index, addr)| PeerConfig { node_id: NodeId::from_index(*index), address: addr.to_string() })
            .collect(),
        consensus: bft_orderer::config::ConsensusConfig {
            protocol,
            batch_size: cli.batch_size,
            ..Default::default()
        },
        storage: bft_orderer::config::StorageConfig { data_dir: cli.storage_path.clone(), ..Default::default() },
        ..Default::default()
    };
    config.validate()?;

    let self_id = config.node_id.clone();
    let identity = Arc::new(IdentitySigner::generate(self_id.clone()));

    let mut peer_addrs: HashMap<NodeId, SocketAddr> = HashMap::new();
    for (index, addr) in &peer_entries {
        peer_addrs.insert(NodeId::from_index(*index), *addr);
    }
    let transport: Arc<dyn ServerTransport> =
        TcpTransport::bind(self_id.clone(), cli.listen_addr, peer_addrs, cli.client_addr).await?;

    let threshold_provider: Option<Arc<dyn ThresholdKeyProvider>> = match protocol {
        ConsensusFlag::Pbft => None,
        _ => {
            let providers = StaticThresholdKeyProvider::bootstrap(cli.cluster_size as usize)?;
            let provider = providers.into_iter().nth(cli.id as usize).ok_or("node id out of range for cluster size")?;
            Some(provider)
        }
    };

    let server_config = ServerConfig {
        self_id,
        cons_kind: protocol.as_kind(),
        cluster_size: cli.cluster_size,
        storage_path: cli.storage_path,
        batch_size: cli.batch_size,
        initial_nodes: config.peers.iter().map(|p| p.node_id.clone()).chain(std::iter::once(config.node_id.clone())).collect(),
    };

    let server = Server::new(server_config, transport, identity, threshold_provider)?;
    server.start().await?;
    info!("node {} running ({:?})", server.self_id(), protocol);

    tokio::signal::ctrl_c().await?;
    if let Err(e) = server.stop().await {
        error!("error stopping server: {e}");
    }
    Ok(())
}
