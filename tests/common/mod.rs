//! Shared multi-`Server` harness for the end-to-end scenario tests
//! (spec.md §8). Builds a fully in-process cluster on `ChannelTransport`,
//! cross-registers every replica's identity key (envelope verification is
//! always identity-based, independent of which consensus core is running),
//! and deals one threshold-BLS key set for the HotStuff family via a shared
//! `StaticThresholdKeyProvider` dealer. PBFT needs no threshold dealer since
//! it signs votes with the plain identity key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use bft_orderer::crypto::IdentitySigner;
use bft_orderer::message::{ConsensusMessage, EnvelopePayload, ServerEnvelope};
use bft_orderer::network::{ChannelTransport, ServerTransport};
use bft_orderer::protocol::ConsensusKind;
use bft_orderer::server::{StaticThresholdKeyProvider, ThresholdKeyProvider};
use bft_orderer::storage::BlockStore;
use bft_orderer::types::{NodeId, Recipient};
use bft_orderer::{Server, ServerConfig};

pub struct Cluster {
    pub servers: Vec<Arc<Server>>,
    pub transports: HashMap<NodeId, Arc<ChannelTransport>>,
    dirs: Vec<tempfile::TempDir>,
    client: Arc<IdentitySigner>,
    client_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Cluster {
    /// Builds and starts `n` replicas running `cons_kind`, batch size 100.
    pub async fn start(cons_kind: ConsensusKind, n: u32) -> Self {
        Self::start_with_batch_size(cons_kind, n, 100).await
    }

    pub async fn start_with_batch_size(cons_kind: ConsensusKind, n: u32, batch_size: usize) -> Self {
        let ids: Vec<NodeId> = (0..n).map(NodeId::from_index).collect();
        let (mut channel_transports, client_rx) = ChannelTransport::cluster(&ids);

        let identities: Vec<Arc<IdentitySigner>> =
            ids.iter().map(|id| Arc::new(IdentitySigner::generate(id.clone()))).collect();
        let client = Arc::new(IdentitySigner::generate(NodeId::from("client")));

        for (i, _) in ids.iter().enumerate() {
            for (j, id_j) in ids.iter().enumerate() {
                if i == j {
                    continue;
                }
                identities[i].register_key(id_j.clone(), identities[j].public_key_bytes());
            }
            identities[i].register_key(NodeId::from("client"), client.public_key_bytes());
        }

        let threshold_providers = if cons_kind == ConsensusKind::Pbft {
            None
        } else {
            Some(StaticThresholdKeyProvider::bootstrap(n as usize).expect("bootstrap never fails for n >= 1"))
        };

        let mut servers = Vec::new();
        let mut transports = HashMap::new();
        let mut dirs = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let dir = tempfile::tempdir().expect("tempdir");
            let owned_transport = channel_transports.remove(id).expect("built above for every id");
            let transport = Arc::new(owned_transport);
            transports.insert(id.clone(), transport.clone());
            let dyn_transport: Arc<dyn ServerTransport> = transport.clone();

            let threshold_provider: Option<Arc<dyn ThresholdKeyProvider>> = match &threshold_providers {
                Some(providers) => Some(providers[i].clone()),
                None => None,
            };

            let config = ServerConfig {
                self_id: id.clone(),
                cons_kind,
                cluster_size: n,
                storage_path: dir.path().to_path_buf(),
                batch_size,
                initial_nodes: ids.clone(),
            };
            let server =
                Server::new(config, dyn_transport, identities[i].clone(), threshold_provider).expect("server builds");
            server.start().await.expect("server starts");
            servers.push(server);
            dirs.push(dir);
        }

        Self { servers, transports, dirs, client, client_rx: AsyncMutex::new(client_rx) }
    }

    pub fn storage_path(&self, index: u32) -> PathBuf {
        self.dirs[index as usize].path().to_path_buf()
    }

    pub fn block_store(&self, index: u32) -> BlockStore {
        BlockStore::open(self.storage_path(index)).expect("reopen recovers existing state")
    }

    /// Submits one client command directly to `leader`'s own transport; the
    /// shared-senders map `ChannelTransport::cluster` builds includes a
    /// self-entry for every id, so this lands straight in the leader's
    /// inbox without a separate client transport handle.
    pub async fn submit(&self, leader: &NodeId, command: Vec<u8>) {
        let envelope = ServerEnvelope::new_signed(
            NodeId::from("client"),
            Recipient::Node(leader.clone()),
            EnvelopePayload::Request(command),
            |bytes| self.client.sign(bytes),
        );
        let bytes = serde_json::to_vec(&envelope).expect("envelope always serializes");
        self.transports[leader].send_to(leader, bytes).await;
    }

    /// Waits for the next `Order` envelope addressed to the shared client
    /// endpoint (e.g. PBFT's `REPLY`) and decodes its `ConsensusMessage`.
    pub async fn recv_client_message(&self, timeout: Duration) -> Option<ConsensusMessage> {
        let bytes = tokio::time::timeout(timeout, async {
            self.client_rx.lock().await.recv().await
        })
        .await
        .ok()
        .flatten()?;
        let envelope: ServerEnvelope = serde_json::from_slice(&bytes).ok()?;
        match envelope.payload {
            EnvelopePayload::Order(msg) => Some(msg),
            _ => None,
        }
    }

    /// Polls every replica's block store until all of them report `height`,
    /// or `timeout` elapses.
    pub async fn wait_for_height(&self, height: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.all_at_height(height) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn all_at_height(&self, height: u64) -> bool {
        (0..self.servers.len() as u32).all(|i| self.block_store(i).get_block_height() >= height)
    }

    pub async fn stop_all(&self) {
        for server in &self.servers {
            let _ = server.stop().await;
        }
    }
}
