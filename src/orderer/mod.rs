//! Orderer façade (spec.md §4.9): owns exactly one protocol core and
//! dispatches to it, short-circuited by `handle_state`/`req_state` flags
//! that the node manager flips off for the duration of a reconfiguration
//! ceremony. Grounded on `protocol/mod.rs`'s `ProtocolCore` tagged variant,
//! generalized from the teacher's single-protocol `node/node.rs` driver to
//! the four-way dispatch `original_source`'s `orderer/orderer.go` performs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::crypto::{IdentitySigner, ThresholdSigner};
use crate::error::{OrdererError, Result};
use crate::message::{ConsensusMessage, NodeMgmtMessage, SyncProof};
use crate::protocol::{
    BasicHotStuff, ChainedHotStuff, ConsensusKind, HotStuff2Core, Outbox, Pbft, ProtocolCore,
};
use crate::storage::BlockStore;
use crate::types::{Hash, NodeId};

/// Bridges the two signing capabilities the four cores need: a threshold-BLS
/// share for the HotStuff family, a plain Ed25519 identity for PBFT. `init`
/// rejects a mismatched pairing rather than letting a core silently start
/// with the wrong capability (spec.md §7 "signer misconstructed" is fatal).
pub enum SignerKind {
    Threshold(Arc<ThresholdSigner>),
    Identity(Arc<IdentitySigner>),
}

pub struct Orderer {
    core: ProtocolCore,
    handle_state: AtomicBool,
    req_state: AtomicBool,
}

impl Orderer {
    /// `init(cons_type, id, nodes, path, outbox, signer)`. `nodes` is the
    /// cluster size at bootstrap; `path` is this replica's block-store
    /// directory.
    pub fn init(
        cons_type: ConsensusKind,
        id: NodeId,
        nodes: u32,
        path: impl Into<PathBuf>,
        outbox: Arc<dyn Outbox>,
        signer: SignerKind,
    ) -> Result<Self> {
        let block_store = Arc::new(BlockStore::open(path)?);
        let core = match (cons_type, signer) {
            (ConsensusKind::BasicHotStuff, SignerKind::Threshold(s)) => {
                ProtocolCore::Basic(BasicHotStuff::new(id, nodes, block_store, s, outbox))
            }
            (ConsensusKind::ChainedHotStuff, SignerKind::Threshold(s)) => {
                ProtocolCore::Chained(ChainedHotStuff::new(id, nodes, block_store, s, outbox))
            }
            (ConsensusKind::HotStuff2, SignerKind::Threshold(s)) => {
                ProtocolCore::Hs2(HotStuff2Core::new(id, nodes, block_store, s, outbox))
            }
            (ConsensusKind::Pbft, SignerKind::Identity(s)) => {
                ProtocolCore::Pbft(Pbft::new(id, nodes, block_store, s, outbox))
            }
            (cons_type, _) => {
                return Err(OrdererError::Configuration(format!(
                    "signer capability does not match consensus protocol {cons_type:?}"
                )))
            }
        };
        Ok(Self {
            core,
            handle_state: AtomicBool::new(true),
            req_state: AtomicBool::new(true),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    pub fn is_waiting_req(&self) -> bool {
        self.core.is_waiting_req()
    }

    pub fn get_leader_name(&self) -> NodeId {
        self.core.get_leader_name()
    }

    /// `handle_msg(bytes, client_pk)`. `client_pk` is reserved for the
    /// per-request signature check the source leaves as a no-op (spec.md §9
    /// open question); it is accepted but unused here for the same reason.
    pub fn handle_msg(&self, bytes: &[u8], _client_pk: Option<&[u8]>) -> Result<()> {
        if !self.handle_state.load(Ordering::SeqCst) {
            return Ok(());
        }
        let msg: ConsensusMessage = serde_json::from_slice(bytes)?;
        self.core.handle_msg(msg)
    }

    pub fn handle_req(
        &self,
        height: u64,
        prev_hash: Hash,
        cur_hash: Hash,
        reqs: Vec<Vec<u8>>,
    ) -> Result<()> {
        if !self.req_state.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.core.handle_req(height, prev_hash, cur_hash, reqs)
    }

    /// Clears both flags and stops the core's timers. The node manager calls
    /// this before touching the node table (spec.md §4.11 correctness
    /// contract: never run a consensus phase and a table change at once).
    pub fn stop(&self) {
        self.handle_state.store(false, Ordering::SeqCst);
        self.req_state.store(false, Ordering::SeqCst);
        self.core.stop();
    }

    /// Clears current-round scratch state and re-enables both flags.
    pub fn reset_state(&self) {
        self.core.reset();
        self.handle_state.store(true, Ordering::SeqCst);
        self.req_state.store(true, Ordering::SeqCst);
    }

    /// Re-emits the pending proposal if local is the current leader and has
    /// one; each core's own `restart()` carries its protocol-specific
    /// first-post-reconfig-round handling (HotStuff-2 additionally skips the
    /// `extends(proposal_qc)` check for the very next PROPOSE).
    pub fn restart_cons(&self) {
        self.core.restart();
    }

    /// True iff the core's view's `cluster_size` equals the registered
    /// member count the signer/identity table has caught up to (PBFT is
    /// always ready, since it has no threshold-signer refresh dependency).
    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    pub fn update_cluster_size(&self, n: u32) {
        self.core.update_cluster_size(n);
    }

    pub fn add_sync_info(&self, msg: &NodeMgmtMessage) {
        self.core.add_sync_info(msg);
    }

    pub fn sync_info(&self, leader_index: u32) -> SyncProof {
        self.core.sync_info(leader_index)
    }

    /// Height the next proposed block should carry (spec.md §4.10): the
    /// Server has no direct reference to the block store the core writes
    /// through, so it asks the core for this before calling `handle_req`.
    pub fn next_height(&self) -> u64 {
        self.core.next_height()
    }

    /// Current view number, for NodeManager's JOIN `SYNC` reply (spec.md §4.11).
    pub fn view_number(&self) -> u64 {
        self.core.view_number()
    }

    /// Current leader index, for NodeManager's JOIN `SYNC` reply (spec.md §4.11).
    pub fn leader_index(&self) -> u32 {
        self.core.leader_index()
    }

    /// Latest committed block, if any, for NodeManager's JOIN `SYNC` reply.
    pub fn current_committed_block(&self) -> Option<crate::types::Block> {
        self.core.current_committed_block()
    }

    /// Applies the quorum-chosen leader a JOIN `RESTART` carries (spec.md §4.11).
    pub fn sync_leader(&self, leader_index: u32) {
        self.core.sync_leader(leader_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_shares;

    struct NullOutbox;
    impl Outbox for NullOutbox {
        fn send(&self, _msg: ConsensusMessage) {}
    }

    #[test]
    fn rejects_mismatched_signer_capability() {
        let identity = Arc::new(IdentitySigner::generate(NodeId::from("r_0")));
        let dir = tempfile::tempdir().unwrap();
        let err = Orderer::init(
            ConsensusKind::BasicHotStuff,
            NodeId::from("r_0"),
            4,
            dir.path(),
            Arc::new(NullOutbox),
            SignerKind::Identity(identity),
        )
        .unwrap_err();
        assert!(matches!(err, OrdererError::Configuration(_)));
    }

    #[test]
    fn dispatches_to_the_selected_protocol() {
        let mut rng = rand::rngs::OsRng;
        let (pk, mut shares) = generate_shares(&mut rng, 3, 4).unwrap();
        let signer = Arc::new(ThresholdSigner::new(shares.remove(0), pk));
        let dir = tempfile::tempdir().unwrap();

        let orderer = Orderer::init(
            ConsensusKind::BasicHotStuff,
            NodeId::from("r_0"),
            4,
            dir.path(),
            Arc::new(NullOutbox),
            SignerKind::Threshold(signer),
        )
        .unwrap();
        assert!(orderer.is_leader());
        assert!(orderer.is_waiting_req());
        orderer
            .handle_req(0, Hash::empty(), Hash::empty(), vec![b"genesis".to_vec()])
            .unwrap();

        orderer.stop();
        orderer
            .handle_req(1, Hash::empty(), Hash::empty(), vec![b"ignored".to_vec()])
            .unwrap();
        orderer.reset_state();
    }
}
