//! Server façade (spec.md §4.10): the per-replica process — owns identity,
//! transport, the swappable Orderer, and drives the node-management
//! ceremony. Grounded on the teacher's `node/node.rs` `running`-guarded
//! start/stop lifecycle and task-spawning shape, generalized from its single
//! fixed protocol to the four-way dispatch `orderer::Orderer` performs, and
//! from its point-to-point network client to the `ServerTransport`
//! abstraction both `ChannelTransport` and `TcpTransport` implement.

pub mod outbox;
pub mod threshold_provider;

pub use outbox::ChannelOutbox;
pub use threshold_provider::{StaticThresholdKeyProvider, ThresholdKeyProvider};

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

use crate::crypto::{IdentitySigner, ThresholdSigner};
use crate::error::{OrdererError, Result};
use crate::message::{
    ConsensusMessage, EnvelopePayload, NodeMgmtMessage, NodeMgmtPayload, ServerEnvelope,
};
use crate::network::ServerTransport;
use crate::node_manager::{NodeManager, NodeManagerEvent};
use crate::orderer::{Orderer, SignerKind};
use crate::protocol::ConsensusKind;
use crate::types::{Block, Hash, NodeId, Recipient};

/// Bootstrap parameters a Server is constructed from (spec.md §6 CLI flags
/// `-pr`, `-n`, `-pa`).
pub struct ServerConfig {
    pub self_id: NodeId,
    pub cons_kind: ConsensusKind,
    pub cluster_size: u32,
    pub storage_path: PathBuf,
    pub batch_size: usize,
    pub initial_nodes: Vec<NodeId>,
}

pub struct Server {
    self_id: NodeId,
    identity: Arc<IdentitySigner>,
    transport: Arc<dyn ServerTransport>,
    orderer: RwLock<Arc<Orderer>>,
    node_manager: Arc<NodeManager>,
    threshold_provider: Option<Arc<dyn ThresholdKeyProvider>>,
    outbox: Arc<ChannelOutbox>,
    outbox_rx: AsyncMutex<mpsc::UnboundedReceiver<ConsensusMessage>>,
    cons_kind: ConsensusKind,
    storage_path: PathBuf,
    batch_size: usize,
    request_queue: SyncMutex<Vec<Vec<u8>>>,
    req_flag_tx: SyncMutex<mpsc::Sender<()>>,
    running: SyncMutex<bool>,
    task_handles: SyncMutex<Vec<JoinHandle<()>>>,
}

fn build_signer_kind(
    cons_kind: ConsensusKind,
    threshold_provider: Option<&dyn ThresholdKeyProvider>,
    cluster_size: u32,
    identity: &Arc<IdentitySigner>,
) -> Result<SignerKind> {
    match cons_kind {
        ConsensusKind::Pbft => Ok(SignerKind::Identity(identity.clone())),
        _ => {
            let provider = threshold_provider.ok_or_else(|| {
                OrdererError::Configuration(
                    "threshold key provider required for a HotStuff-family protocol".into(),
                )
            })?;
            let (share, public_key) = provider.share_for(cluster_size as usize)?;
            Ok(SignerKind::Threshold(Arc::new(ThresholdSigner::new(share, public_key))))
        }
    }
}

impl Server {
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn ServerTransport>,
        identity: Arc<IdentitySigner>,
        threshold_provider: Option<Arc<dyn ThresholdKeyProvider>>,
    ) -> Result<Arc<Self>> {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let outbox = Arc::new(ChannelOutbox::new(outbox_tx));
        let node_manager = Arc::new(NodeManager::new(config.self_id.clone(), config.initial_nodes));
        let (req_flag_tx, _req_flag_rx) = mpsc::channel(1);

        let signer = build_signer_kind(
            config.cons_kind,
            threshold_provider.as_deref(),
            config.cluster_size,
            &identity,
        )?;
        let orderer = Orderer::init(
            config.cons_kind,
            config.self_id.clone(),
            config.cluster_size,
            config.storage_path.clone(),
            outbox.clone(),
            signer,
        )?;

        Ok(Arc::new(Self {
            self_id: config.self_id,
            identity,
            transport,
            orderer: RwLock::new(Arc::new(orderer)),
            node_manager,
            threshold_provider,
            outbox,
            outbox_rx: AsyncMutex::new(outbox_rx),
            cons_kind: config.cons_kind,
            storage_path: config.storage_path,
            batch_size: config.batch_size,
            request_queue: SyncMutex::new(Vec::new()),
            req_flag_tx: SyncMutex::new(req_flag_tx),
            running: SyncMutex::new(false),
            task_handles: SyncMutex::new(Vec::new()),
        }))
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Kicks off the JOIN ceremony: broadcasts APPLY to the cluster this
    /// replica wants to enter. The caller (`bft-node -join`) is expected to
    /// have bootstrapped this Server against a single-node "cluster size 1"
    /// view of itself; the real cluster size arrives later via RESTART.
    pub async fn start_join(&self) {
        let events = self.node_manager.start_join(self.identity.public_key_bytes());
        self.apply_node_manager_events(events).await;
    }

    pub async fn start_exit(&self) {
        let events = self.node_manager.start_exit();
        self.apply_node_manager_events(events).await;
    }

    /// Queues a client command and wakes the request-batching loop
    /// (spec.md §4.10). Best-effort: a full flag channel means a wake-up is
    /// already pending, so the new entry will be picked up by that one.
    fn enqueue_request(&self, cmd: Vec<u8>) {
        self.request_queue.lock().push(cmd);
        let _ = self.req_flag_tx.lock().try_send(());
    }

    /// Verifies and dispatches one inbound `ServerEnvelope`.
    async fn route_server_msg(&self, envelope: ServerEnvelope) {
        if !envelope.verify(|sender, sig, bytes| self.identity.verify(sender, sig, bytes)) {
            warn!("server: dropping envelope from {} with invalid signature", envelope.send_server);
            return;
        }
        match envelope.payload {
            EnvelopePayload::Request(cmd) => {
                self.enqueue_request(cmd);
            }
            EnvelopePayload::Order(msg) => {
                let bytes = match serde_json::to_vec(&msg) {
                    Ok(b) => b,
                    Err(e) => {
                        error!("server: failed to re-encode consensus message: {e}");
                        return;
                    }
                };
                let orderer = self.orderer.read().await.clone();
                if let Err(e) = orderer.handle_msg(&bytes, None) {
                    debug!("server: handle_msg error: {e}");
                }
            }
            EnvelopePayload::NodeMgmt(msg) => {
                let events = self.dispatch_node_mgmt(&msg).await;
                self.apply_node_manager_events(events).await;
            }
        }
    }

    async fn dispatch_node_mgmt(&self, msg: &NodeMgmtMessage) -> Vec<NodeManagerEvent> {
        match &msg.payload {
            NodeMgmtPayload::Apply { .. } => {
                let orderer = self.orderer.read().await.clone();
                let view_number = orderer.view_number();
                let leader_index = orderer.leader_index();
                let current_block = orderer
                    .current_committed_block()
                    .unwrap_or_else(|| Block::empty(0, 0, Hash::empty()));
                let proof = orderer.sync_info(leader_index);
                let identity_public_keys = self.identity.known_keys();
                self.node_manager
                    .on_apply(msg, view_number, leader_index, current_block, proof, identity_public_keys)
            }
            NodeMgmtPayload::Sync { .. } => self.node_manager.on_sync(msg),
            NodeMgmtPayload::Agree => self.node_manager.on_agree(msg),
            NodeMgmtPayload::Restart { .. } => self.node_manager.on_restart(msg),
        }
    }

    async fn apply_node_manager_events(&self, events: Vec<NodeManagerEvent>) {
        for event in events {
            match event {
                NodeManagerEvent::StopOrderer => {
                    self.orderer.read().await.stop();
                }
                NodeManagerEvent::Send { to, payload } => {
                    self.send_node_mgmt(to, payload).await;
                }
                NodeManagerEvent::ApplyNodeTable(nodes) => {
                    debug!("server {}: node table now {:?}", self.self_id, nodes);
                }
                NodeManagerEvent::UpdateClusterSize(n) => {
                    self.orderer.read().await.update_cluster_size(n);
                }
                NodeManagerEvent::RefreshSigner { total, .. } => {
                    if let Err(e) = self.refresh_signer(total as u32).await {
                        error!("server {}: failed to refresh signer for {total} nodes: {e}", self.self_id);
                    }
                }
                NodeManagerEvent::RegisterIdentityKey(node, key) => {
                    self.identity.register_key(node, key);
                }
                NodeManagerEvent::RemoveIdentityKey(node) => {
                    self.identity.remove_key(&node);
                }
                NodeManagerEvent::SyncLeader(leader_index) => {
                    self.orderer.read().await.sync_leader(leader_index);
                }
                NodeManagerEvent::RestartOrderer => {
                    let orderer = self.orderer.read().await.clone();
                    orderer.reset_state();
                    orderer.restart_cons();
                }
            }
        }
    }

    async fn send_node_mgmt(&self, to: Recipient, payload: NodeMgmtPayload) {
        let envelope = ServerEnvelope::new_signed(
            self.self_id.clone(),
            to.clone(),
            EnvelopePayload::NodeMgmt(NodeMgmtMessage { sender: self.self_id.clone(), payload }),
            |bytes| self.identity.sign(bytes),
        );
        let encoded = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                error!("server {}: failed to encode node-mgmt envelope: {e}", self.self_id);
                return;
            }
        };
        self.deliver(to, encoded).await;
    }

    /// Rebuilds the `Orderer` against a freshly dealt signer for the new
    /// cluster size, swapping it into the `RwLock` in place. Safe because
    /// `BlockStore::open` rescans its directory and recovers height/
    /// previous-hash on every call, so the rebuilt core picks up exactly
    /// where the old one left off.
    async fn refresh_signer(&self, cluster_size: u32) -> Result<()> {
        let signer = build_signer_kind(
            self.cons_kind,
            self.threshold_provider.as_deref(),
            cluster_size,
            &self.identity,
        )?;
        let rebuilt = Orderer::init(
            self.cons_kind,
            self.self_id.clone(),
            cluster_size,
            self.storage_path.clone(),
            self.outbox.clone(),
            signer,
        )?;
        *self.orderer.write().await = Arc::new(rebuilt);
        Ok(())
    }

    /// Resolves a `ConsensusMessage`'s/`NodeMgmtPayload`'s recipient against
    /// the transport: `Broadcast`/`Gossip` fan out to every known node,
    /// `Client` goes to the shared client endpoint, `Node(id)` goes direct.
    /// The transport has no loopback of its own, so a self-addressed or
    /// self-included envelope is looped back into local dispatch instead of
    /// being sent (a single-replica cluster, and a PBFT primary's own
    /// `PrePrepare`, both depend on this).
    async fn deliver(&self, to: Recipient, bytes: Vec<u8>) {
        match to {
            Recipient::Broadcast | Recipient::Gossip => {
                for node in self.transport.known_nodes() {
                    if node == self.self_id {
                        continue;
                    }
                    self.transport.send_to(&node, bytes.clone()).await;
                }
                self.deliver_to_self(&bytes).await;
            }
            Recipient::Client => self.transport.send_client(bytes).await,
            Recipient::Node(node) => {
                if node == self.self_id {
                    self.deliver_to_self(&bytes).await;
                    return;
                }
                self.transport.send_to(&node, bytes).await;
            }
        }
    }

    /// Decodes a self-addressed envelope and re-enters it through the same
    /// verify-then-dispatch path an inbound transport message takes.
    async fn deliver_to_self(&self, bytes: &[u8]) {
        match serde_json::from_slice::<ServerEnvelope>(bytes) {
            Ok(envelope) => self.route_server_msg(envelope).await,
            Err(e) => error!("server {}: failed to decode self-addressed envelope: {e}", self.self_id),
        }
    }

    /// Drains the Orderer's outbox forever, signing and routing every
    /// `ConsensusMessage` it produces. One task per Server (spec.md §5).
    async fn run_outbox_drain(self: Arc<Self>) {
        loop {
            let msg = {
                let mut rx = self.outbox_rx.lock().await;
                rx.recv().await
            };
            let Some(msg) = msg else {
                break;
            };
            let to = msg.receiver.clone();
            let envelope = ServerEnvelope::new_signed(
                self.self_id.clone(),
                to.clone(),
                EnvelopePayload::Order(msg),
                |bytes| self.identity.sign(bytes),
            );
            let encoded = match serde_json::to_vec(&envelope) {
                Ok(b) => b,
                Err(e) => {
                    error!("server {}: failed to encode consensus envelope: {e}", self.self_id);
                    continue;
                }
            };
            self.deliver(to, encoded).await;
        }
    }

    /// Blocks on the request-queue wake-up signal and, iff this replica is
    /// the current leader with `0 < queue.len() <= batch_size` requests
    /// pending, drains the queue into one `Orderer::handle_req` call
    /// (spec.md §4.10, §9 "coroutine control flow").
    async fn run_request_batcher(self: Arc<Self>, mut flag_rx: mpsc::Receiver<()>) {
        while flag_rx.recv().await.is_some() {
            let orderer = self.orderer.read().await.clone();
            if !orderer.is_leader() || !orderer.is_waiting_req() {
                continue;
            }
            let batch = {
                let mut queue = self.request_queue.lock();
                let len = queue.len();
                if len == 0 || len > self.batch_size {
                    continue;
                }
                std::mem::take(&mut *queue)
            };
            if batch.is_empty() {
                continue;
            }
            let height = orderer.next_height();
            if let Err(e) = orderer.handle_req(height, Hash::empty(), Hash::empty(), batch) {
                error!("server {}: handle_req failed: {e}", self.self_id);
            }
        }
    }

    /// Pulls raw envelope bytes off the transport forever and routes each
    /// one. One task per Server (spec.md §5).
    async fn run_recv_loop(self: Arc<Self>) {
        while let Some(bytes) = self.transport.recv().await {
            let envelope: ServerEnvelope = match serde_json::from_slice(&bytes) {
                Ok(e) => e,
                Err(e) => {
                    warn!("server {}: dropping malformed envelope: {e}", self.self_id);
                    continue;
                }
            };
            self.route_server_msg(envelope).await;
        }
    }

    /// Starts the outbox drain, request batcher, and inbound receive loop
    /// tasks. Grounded on the teacher's `Node::start` `running`-guard
    /// pattern: returns `AlreadyStarted` rather than spawning a second set.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.running.lock();
            if *running {
                return Err(OrdererError::AlreadyStarted);
            }
            *running = true;
        }

        let (flag_tx, flag_rx) = mpsc::channel(1);
        *self.req_flag_tx.lock() = flag_tx;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(self.clone().run_outbox_drain()));
        handles.push(tokio::spawn(self.clone().run_request_batcher(flag_rx)));
        handles.push(tokio::spawn(self.clone().run_recv_loop()));
        *self.task_handles.lock() = handles;

        info!("server {} started", self.self_id);
        Ok(())
    }

    /// Aborts every spawned task. Grounded on the teacher's `Node::stop`
    /// `abort`-then-await pattern.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.running.lock();
            if !*running {
                return Err(OrdererError::NotRunning);
            }
            *running = false;
        }

        let handles = std::mem::take(&mut *self.task_handles.lock());
        for handle in handles {
            handle.abort();
        }
        self.orderer.read().await.stop();
        info!("server {} stopped", self.self_id);
        Ok(())
    }
}
