//! Chained (pipelined) HotStuff core (spec.md §4.6). One phase (`GENERIC`)
//! carries both the proposal and the previous round's justify QC; the
//! three-chain rule commits a block once three consecutive proposals have
//! been certified back-to-back. Grounded on `basic_hotstuff.rs`'s vote
//! collection/QC-formation shape, generalized from four sequential phases
//! to one pipelined phase with a sliding parent-QC window, per
//! `original_source`'s `orderer/consensus/hotstuff/core/chained_hotstuff.go`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::consensus::{MessageLog, Timer};
use crate::crypto::ThresholdSigner;
use crate::error::Result;
use crate::message::{ConsensusMessage, ConsensusPayload, NodeMgmtMessage, SyncProof};
use crate::storage::BlockStore;
use crate::types::{Block, Hash, HsNode, NodeId, Proposal, QcType, QuorumCert, Recipient, View};

use super::basic_hotstuff::{node_signing_bytes, parse_share, share_bytes};
use super::Outbox;

struct ChainLink {
    node: HsNode,
    /// The QC this node's own proposal carried, certifying its parent.
    justify: Option<QuorumCert>,
}

struct Mutable {
    view: View,
    high_qc: QuorumCert,
    locked_qc: Option<QuorumCert>,
    current_node: HsNode,
    chain: HashMap<Hash, ChainLink>,
    /// Blocks proposed but not yet committed, keyed by `current_hash` — the
    /// pipeline keeps several in flight at once, so (unlike basic HotStuff
    /// and HotStuff-2) a single `BlockStore.current` slot isn't enough.
    pending: HashMap<Hash, Block>,
    /// Height the *next* proposal should carry. Tracked independently of
    /// `BlockStore.height` because the three-chain rule commits a proposal
    /// only once two further proposals have been certified on top of it —
    /// `BlockStore.height` stays frozen for that whole window, while the
    /// pipeline keeps proposing past it.
    next_proposal_height: u64,
}

pub struct ChainedHotStuff {
    node_id: NodeId,
    f: usize,
    block_store: Arc<BlockStore>,
    signer: Arc<ThresholdSigner>,
    outbox: Arc<dyn Outbox>,
    state: Mutex<Mutable>,
    log: Mutex<MessageLog>,
    timer: Mutex<Timer>,
    handle_state: AtomicBool,
    registered_members: AtomicU32,
}

fn threshold(f: usize) -> usize {
    2 * f + 1
}

impl ChainedHotStuff {
    pub fn new(
        node_id: NodeId,
        cluster_size: u32,
        block_store: Arc<BlockStore>,
        signer: Arc<ThresholdSigner>,
        outbox: Arc<dyn Outbox>,
    ) -> Arc<Self> {
        let f = ((cluster_size as usize).saturating_sub(1)) / 3;
        let genesis = HsNode::genesis();
        let genesis_qc = QuorumCert::single(QcType::Generic, 0, genesis, Vec::new());
        let mut chain = HashMap::new();
        chain.insert(
            genesis.current_hash,
            ChainLink {
                node: genesis,
                justify: None,
            },
        );
        let next_proposal_height = block_store.get_block_height();
        Arc::new(Self {
            node_id,
            f,
            block_store,
            signer,
            outbox,
            state: Mutex::new(Mutable {
                view: View::genesis(cluster_size),
                high_qc: genesis_qc,
                locked_qc: None,
                current_node: genesis,
                chain,
                pending: HashMap::new(),
                next_proposal_height,
            }),
            log: Mutex::new(MessageLog::new(0)),
            timer: Mutex::new(Timer::new()),
            handle_state: AtomicBool::new(true),
            registered_members: AtomicU32::new(cluster_size),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().view.leader_name() == self.node_id
    }

    /// The pipeline has no distinct waiting phase: a leader proposes for
    /// every batch the moment it arrives.
    pub fn is_waiting_req(&self) -> bool {
        self.is_leader()
    }

    pub fn get_leader_name(&self) -> NodeId {
        self.state.lock().view.leader_name()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().view.cluster_size() == self.registered_members.load(Ordering::SeqCst)
    }

    /// Height the *next* proposal should carry, not `BlockStore.height`
    /// (which lags up to two proposals behind the pipeline's tip under the
    /// three-chain commit rule).
    pub fn next_height(&self) -> u64 {
        self.state.lock().next_proposal_height
    }

    /// Current view number, for a SYNC reply's `(view_number, ...)` tuple
    /// (spec.md §4.11).
    pub fn view_number(&self) -> u64 {
        self.state.lock().view.view_number()
    }

    /// Current leader index, for a SYNC reply's `(view_number, leader_index,
    /// ...)` tuple (spec.md §4.11).
    pub fn leader_index(&self) -> u32 {
        self.state.lock().view.leader_index()
    }

    /// Forces the view's leader index to `leader_index` without moving the
    /// view number (spec.md §4.11 JOIN restart: the rebuilt orderer's fresh
    /// genesis view must carry the quorum-chosen leader, not index 0).
    pub fn sync_leader(&self, leader_index: u32) {
        let mut state = self.state.lock();
        let view_number = state.view.view_number();
        state.view.update(view_number, leader_index);
    }

    /// Latest committed block, if any, for a SYNC reply's `current_block`.
    pub fn current_committed_block(&self) -> Option<crate::types::Block> {
        let height = self.block_store.get_block_height();
        if height == 0 {
            return None;
        }
        self.block_store.read_block(height - 1).ok().flatten()
    }

    pub fn update_cluster_size(&self, n: u32) {
        self.state.lock().view.update_cluster_size(n);
        self.registered_members.store(n, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.handle_state.store(false, Ordering::SeqCst);
        self.timer.lock().stop();
    }

    pub fn reset(&self) {
        let view_number = self.state.lock().view.view_number();
        self.log.lock().gc_view(view_number);
        self.handle_state.store(true, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.reset();
        if self.is_leader() {
            if let Some(block) = self.block_store.current_proposal() {
                self.broadcast_proposal(block);
            }
        }
    }

    pub fn add_sync_info(&self, _msg: &NodeMgmtMessage) {}

    pub fn sync_info(&self, leader_index: u32) -> SyncProof {
        let state = self.state.lock();
        let qc = state.locked_qc.clone().unwrap_or_else(|| state.high_qc.clone());
        let _ = leader_index;
        SyncProof::HotStuffFamily(qc)
    }

    fn active(&self) -> bool {
        self.handle_state.load(Ordering::SeqCst)
    }

    pub fn handle_req(&self, height: u64, _prev_hash: Hash, _cur_hash: Hash, reqs: Vec<Vec<u8>>) -> Result<()> {
        if !self.active() || !self.is_leader() {
            return Ok(());
        }
        let (view_number, parent_hash) = {
            let state = self.state.lock();
            (state.view.view_number(), state.current_node.current_hash)
        };
        // Chains off the pipeline's own tip, not `BlockStore.previous_hash`
        // (which only advances on commit and lags up to two proposals
        // behind under the three-chain rule).
        let root = Hash::from_bytes(&reqs.concat());
        let block = crate::types::Block::new(height, view_number, parent_hash, root, reqs);
        self.block_store.adopt_proposal(block.clone());
        self.state.lock().next_proposal_height = height + 1;
        self.broadcast_proposal(block);
        Ok(())
    }

    fn broadcast_proposal(&self, block: crate::types::Block) {
        let node = block.node();
        let (view_number, justify) = {
            let mut state = self.state.lock();
            let justify = state.high_qc.clone();
            state.current_node = node;
            state.chain.insert(
                node.current_hash,
                ChainLink {
                    node,
                    justify: Some(justify.clone()),
                },
            );
            state.pending.insert(node.current_hash, block.clone());
            (state.view.view_number(), justify)
        };

        let proposal = Proposal::new(
            block.header.height,
            view_number,
            block.header.prev_block_hash,
            block.header.root_hash,
            block.header.timestamp_ms,
            block.data.transactions.clone(),
        );
        self.outbox.send(ConsensusMessage::new(
            view_number,
            self.node_id.clone(),
            Recipient::Broadcast,
            Vec::new(),
            ConsensusPayload::Generic { proposal, justify },
        ));
        self.arm_timer(view_number);
    }

    fn arm_timer(&self, view_number: u64) {
        let node_id = self.node_id.clone();
        let outbox = self.outbox.clone();
        let high_qc = self.state.lock().high_qc.clone();
        self.timer.lock().start(move || {
            warn!("chained-hotstuff: view {view_number} timed out on {node_id}");
            outbox.send(ConsensusMessage::new(
                view_number + 1,
                node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::NewView {
                    justify: Some(high_qc.clone()),
                },
            ));
        });
    }

    pub fn handle_msg(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        match &msg.payload {
            ConsensusPayload::Generic { .. } => self.on_generic(msg),
            ConsensusPayload::GenericVote => self.on_generic_vote(msg),
            ConsensusPayload::NewView { .. } => self.on_new_view(msg),
            _ => Ok(()),
        }
    }

    fn on_new_view(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let view_number = msg.view_number;
        let inserted = self.log.lock().insert("NEW_VIEW", view_number, None, msg);
        if !inserted {
            return Ok(());
        }
        if !self.log.lock().has_quorum("NEW_VIEW", view_number, None, self.f) {
            return Ok(());
        }
        if let Some(qc) = self.log.lock().highest_new_view_justify(view_number) {
            let mut state = self.state.lock();
            if qc.view_number > state.high_qc.view_number {
                state.high_qc = qc;
            }
        }
        self.log.lock().gc_view(view_number);
        state_advance_view(&self.state, &self.timer);
        Ok(())
    }

    fn on_generic(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Generic { proposal, justify } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        let root = proposal.root_hash.unwrap_or_else(Hash::empty);
        let block = crate::types::Block::with_timestamp(
            proposal.height,
            proposal.view_number,
            proposal.prev_block_hash.unwrap_or_else(Hash::empty),
            root,
            proposal.timestamp_ms,
            proposal.commands.clone(),
        );
        let node = block.node();
        if !node.extends(&justify.node()) {
            warn!("chained-hotstuff: GENERIC proposal does not extend its justify");
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            if let Some(locked) = &state.locked_qc {
                if !node.extends(&locked.node()) && justify.view_number <= locked.view_number {
                    warn!("chained-hotstuff: unsafe proposal rejected");
                    return Ok(());
                }
            }
            state.current_node = node;
            state.chain.insert(
                node.current_hash,
                ChainLink {
                    node,
                    justify: Some(justify.clone()),
                },
            );
            state.pending.insert(node.current_hash, block.clone());
            if justify.view_number > state.high_qc.view_number {
                state.high_qc = justify.clone();
            }
        }

        let share = self
            .signer
            .partial_sign(&node_signing_bytes(QcType::Generic, msg.view_number, &node));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Node(self.get_leader_name()),
            share_bytes(&share),
            ConsensusPayload::GenericVote,
        ));

        // A follower rotates its own view and tells the next leader it may
        // propose; the leader's view instead advances once its own
        // GENERIC_VOTE quorum forms (`on_generic_vote`), so it skips this to
        // avoid rotating twice for the same round.
        if !self.is_leader() {
            let (new_leader, new_view_number, high_qc) = {
                let mut state = self.state.lock();
                state.view.next_view();
                (state.view.leader_name(), state.view.view_number(), state.high_qc.clone())
            };
            self.timer.lock().stop();
            self.outbox.send(ConsensusMessage::new(
                new_view_number,
                self.node_id.clone(),
                Recipient::Node(new_leader),
                Vec::new(),
                ConsensusPayload::NewView {
                    justify: Some(high_qc),
                },
            ));
            self.arm_timer(new_view_number);
        }
        Ok(())
    }

    fn on_generic_vote(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let node = self.state.lock().current_node;
        let view_number = msg.view_number;
        let inserted = self
            .log
            .lock()
            .insert("GENERIC_VOTE", view_number, Some(node.current_hash), msg);
        if !inserted {
            return Ok(());
        }
        if !self
            .log
            .lock()
            .has_quorum("GENERIC_VOTE", view_number, Some(node.current_hash), self.f)
        {
            return Ok(());
        }
        let shares = self
            .log
            .lock()
            .messages("GENERIC_VOTE", view_number, Some(node.current_hash))
            .iter()
            .filter_map(|m| parse_share(&m.sig_share))
            .collect::<Vec<_>>();
        let bytes = node_signing_bytes(QcType::Generic, view_number, &node);
        let Ok(agg) = self.signer.combine(&shares, threshold(self.f)) else {
            return Ok(());
        };
        if !self.signer.verify_combined(&bytes, &agg) {
            warn!("chained-hotstuff: combined GENERIC signature failed to verify");
            return Ok(());
        }
        let qc = QuorumCert::single(QcType::Generic, view_number, node, agg.point.to_compressed().to_vec());

        self.apply_three_chain(&qc)?;
        self.state.lock().high_qc = qc.clone();
        self.log.lock().gc_view(view_number);
        state_advance_view(&self.state, &self.timer);
        Ok(())
    }

    /// Walks the freshly-formed QC's chain back three links: `b3 (= qc.node())
    /// <- b2 <- b1`. If the chain is unbroken, `b2`'s QC becomes locked and
    /// `b1` commits (spec.md §4.6 three-chain rule).
    fn apply_three_chain(&self, qc: &QuorumCert) -> Result<()> {
        let b3 = qc.node();
        let mut state = self.state.lock();
        let Some(justify2) = state.chain.get(&b3.current_hash).and_then(|l| l.justify.clone()) else {
            return Ok(());
        };
        let b2 = justify2.node();
        if !b3.extends(&b2) {
            return Ok(());
        }
        let Some(justify1) = state.chain.get(&b2.current_hash).and_then(|l| l.justify.clone()) else {
            return Ok(());
        };
        let b1 = justify1.node();
        if !b2.extends(&b1) {
            return Ok(());
        }

        state.locked_qc = Some(justify2.clone());
        let committed = state.pending.remove(&b1.current_hash);
        state.chain.remove(&b1.current_hash);
        drop(state);

        if let Some(mut block) = committed {
            block.attach_validation(justify1.aggregate_sig.clone());
            self.block_store.store_block(block)?;
            info!("chained-hotstuff: committed block via three-chain rule");
        }
        Ok(())
    }
}

fn state_advance_view(state: &Mutex<Mutable>, timer: &Mutex<Timer>) {
    let mut s = state.lock();
    s.view.next_view();
    drop(s);
    timer.lock().stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_shares;

    #[test]
    fn leader_pipelines_proposals_without_waiting() {
        let mut rng = rand::rngs::OsRng;
        let (pk, mut shares) = generate_shares(&mut rng, 3, 4).unwrap();
        let signer = Arc::new(ThresholdSigner::new(shares.remove(0), pk));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());

        struct NullOutbox;
        impl Outbox for NullOutbox {
            fn send(&self, _msg: ConsensusMessage) {}
        }

        let core = ChainedHotStuff::new(NodeId::from("r_0"), 4, store, signer, Arc::new(NullOutbox));
        assert!(core.is_waiting_req());
        core.handle_req(0, Hash::empty(), Hash::empty(), vec![b"a".to_vec()]).unwrap();
        assert_eq!(core.state.lock().current_node.current_hash.is_empty(), false);
    }
}
