//! HotStuff-2 core (spec.md §4.7): two-phase optimistic pipeline with
//! `PROPOSE -> VOTE1 -> PREPARE -> VOTE2` and no distinct pre-commit/commit
//! round-trip. A block commits the moment its `PREPARE`-tier QC forms
//! (double certification); the freshly-committed QC becomes next round's
//! `proposal_qc` so the next proposal can go out the same instant (the
//! "ENTER fast path" / optimistic responsiveness). View-change replaces
//! basic/chained's `NEW_VIEW` broadcast with `WISH` aggregation into a
//! timeout certificate (`TC_MSG`). Grounded on `chained_hotstuff.rs`'s
//! pipelined vote-collection shape and `consensus/pacemaker.rs`'s
//! `WishAggregator`/`EnterTimer`, generalized from
//! `original_source`'s `orderer/consensus/hotstuff/core/hotstuff2.go`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::consensus::{EnterTimer, MessageLog, Timer, WishAggregator};
use crate::crypto::ThresholdSigner;
use crate::error::Result;
use crate::message::{ConsensusMessage, ConsensusPayload, NodeMgmtMessage, SignedVote, SyncProof};
use crate::storage::BlockStore;
use crate::types::{Hash, HsNode, NodeId, Proposal, QcType, QuorumCert, Recipient, View};

use super::basic_hotstuff::{node_signing_bytes, parse_share, share_bytes};
use super::Outbox;

struct Mutable {
    view: View,
    proposal_qc: QuorumCert,
    prepare_qc: Option<QuorumCert>,
    current_node: HsNode,
    current_height: u64,
    wish: Option<WishAggregator>,
}

pub struct HotStuff2Core {
    node_id: NodeId,
    f: usize,
    block_store: Arc<BlockStore>,
    signer: Arc<ThresholdSigner>,
    outbox: Arc<dyn Outbox>,
    state: Mutex<Mutable>,
    log: Mutex<MessageLog>,
    timer: Mutex<Timer>,
    enter_timer: Mutex<EnterTimer>,
    handle_state: AtomicBool,
    registered_members: AtomicU32,
    /// Set by `restart()` after a reconfiguration; the next PROPOSE is
    /// accepted without checking `extends(proposal_qc)` since the locally
    /// held `proposal_qc` predates the node-set change and cannot be
    /// expected to dominate the new leader's (spec.md §9 open question).
    ignore_stale_qc: AtomicBool,
}

fn threshold(f: usize) -> usize {
    2 * f + 1
}

impl HotStuff2Core {
    pub fn new(
        node_id: NodeId,
        cluster_size: u32,
        block_store: Arc<BlockStore>,
        signer: Arc<ThresholdSigner>,
        outbox: Arc<dyn Outbox>,
    ) -> Arc<Self> {
        let f = ((cluster_size as usize).saturating_sub(1)) / 3;
        let genesis = HsNode::genesis();
        Arc::new(Self {
            node_id,
            f,
            block_store,
            signer,
            outbox,
            state: Mutex::new(Mutable {
                view: View::genesis(cluster_size),
                proposal_qc: QuorumCert::hs2(QcType::Hs2Proposal, 0, genesis, 0, Vec::new()),
                prepare_qc: None,
                current_node: genesis,
                current_height: 0,
                wish: None,
            }),
            log: Mutex::new(MessageLog::new(0)),
            timer: Mutex::new(Timer::new()),
            enter_timer: Mutex::new(Timer::new()),
            handle_state: AtomicBool::new(true),
            registered_members: AtomicU32::new(cluster_size),
            ignore_stale_qc: AtomicBool::new(false),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().view.leader_name() == self.node_id
    }

    pub fn is_waiting_req(&self) -> bool {
        self.is_leader()
    }

    pub fn get_leader_name(&self) -> NodeId {
        self.state.lock().view.leader_name()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().view.cluster_size() == self.registered_members.load(Ordering::SeqCst)
    }

    pub fn next_height(&self) -> u64 {
        self.block_store.get_block_height()
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
        self.enter_timer.lock().stop();
    }

    pub fn reset(&self) {
        let view_number = self.state.lock().view.view_number();
        self.log.lock().gc_view(view_number);
        self.handle_state.store(true, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.reset();
        self.ignore_stale_qc.store(true, Ordering::SeqCst);
        if self.is_leader() {
            if let Some(block) = self.block_store.current_proposal() {
                self.broadcast_proposal(block);
            }
        }
    }

    pub fn add_sync_info(&self, _msg: &NodeMgmtMessage) {}

    pub fn sync_info(&self, leader_index: u32) -> SyncProof {
        let state = self.state.lock();
        let qc = state.prepare_qc.clone().unwrap_or_else(|| state.proposal_qc.clone());
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
        let view_number = self.state.lock().view.view_number();
        let block = self.block_store.gen_new_block(view_number, reqs, Some(height));
        self.broadcast_proposal(block);
        Ok(())
    }

    fn broadcast_proposal(&self, block: crate::types::Block) {
        let node = block.node();
        let (view_number, proposal_qc) = {
            let mut state = self.state.lock();
            state.current_node = node;
            state.current_height = block.header.height;
            (state.view.view_number(), state.proposal_qc.clone())
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
            ConsensusPayload::Propose {
                proposal,
                proposal_qc: Some(proposal_qc),
            },
        ));
        self.arm_view_timer(view_number);
    }

    fn arm_view_timer(&self, view_number: u64) {
        let node_id = self.node_id.clone();
        let outbox = self.outbox.clone();
        self.timer.lock().start(move || {
            warn!("hotstuff2: view {view_number} timed out on {node_id}");
            outbox.send(ConsensusMessage::new(
                view_number + 1,
                node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::Wish {
                    target_view: view_number + 1,
                },
            ));
        });
    }

    pub fn handle_msg(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        match &msg.payload {
            ConsensusPayload::Propose { .. } => self.on_propose(msg),
            ConsensusPayload::Vote1 => self.on_vote1(msg),
            ConsensusPayload::Hs2Prepare { .. } => self.on_hs2_prepare(msg),
            ConsensusPayload::Vote2 => self.on_vote2(msg),
            ConsensusPayload::Wish { .. } => self.on_wish(msg),
            ConsensusPayload::TcMsg { .. } => self.on_tc_msg(msg),
            ConsensusPayload::Enter { .. } => self.on_enter(msg),
            _ => Ok(()),
        }
    }

    fn on_propose(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Propose { proposal, proposal_qc } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        let Some(proposal_qc) = proposal_qc.clone() else {
            return Ok(());
        };
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
        let first_round_after_reconfig = self.ignore_stale_qc.swap(false, Ordering::SeqCst);
        if !first_round_after_reconfig && !node.extends(&proposal_qc.node()) {
            warn!("hotstuff2: PROPOSE does not extend its proposal_qc");
            return Ok(());
        }
        self.block_store.adopt_proposal(block);

        {
            let mut state = self.state.lock();
            state.current_node = node;
            state.current_height = block.header.height;
            if first_round_after_reconfig || proposal_qc.view_number > state.proposal_qc.view_number {
                state.proposal_qc = proposal_qc;
            }
        }

        let share = self.signer.partial_sign(&node_signing_bytes(QcType::Hs2Proposal, msg.view_number, &node));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Node(self.get_leader_name()),
            share_bytes(&share),
            ConsensusPayload::Vote1,
        ));
        self.arm_view_timer(msg.view_number);
        Ok(())
    }

    fn on_vote1(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let (node, height) = {
            let state = self.state.lock();
            (state.current_node, state.current_height)
        };
        let view_number = msg.view_number;
        let Some(qc) = collect(
            &self.log,
            &self.signer,
            self.f,
            "VOTE1",
            view_number,
            node,
            height,
            QcType::Hs2Proposal,
            msg,
        ) else {
            return Ok(());
        };
        self.outbox.send(ConsensusMessage::new(
            view_number,
            self.node_id.clone(),
            Recipient::Broadcast,
            Vec::new(),
            ConsensusPayload::Hs2Prepare { qc },
        ));
        Ok(())
    }

    fn on_hs2_prepare(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Hs2Prepare { qc } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        if qc.node() != self.state.lock().current_node {
            return Ok(());
        }
        let share = self.signer.partial_sign(&node_signing_bytes(QcType::Hs2Prepare, msg.view_number, &qc.node()));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Node(self.get_leader_name()),
            share_bytes(&share),
            ConsensusPayload::Vote2,
        ));
        Ok(())
    }

    fn on_vote2(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let (node, height) = {
            let state = self.state.lock();
            (state.current_node, state.current_height)
        };
        let view_number = msg.view_number;
        let Some(qc) = collect(
            &self.log,
            &self.signer,
            self.f,
            "VOTE2",
            view_number,
            node,
            height,
            QcType::Hs2Prepare,
            msg,
        ) else {
            return Ok(());
        };

        if let Some(mut block) = self.block_store.current_proposal() {
            if block.node() == node {
                block.attach_validation(qc.aggregate_sig.clone());
                self.block_store.store_block(block)?;
                info!("hotstuff2: committed block via double certification");
            }
        }

        {
            let mut state = self.state.lock();
            state.prepare_qc = Some(qc.clone());
            state.proposal_qc = qc;
            state.view.next_view();
        }
        self.log.lock().gc_view(view_number);
        self.timer.lock().stop();
        Ok(())
    }

    fn on_wish(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Wish { target_view } = &msg.payload else {
            return Ok(());
        };
        let target_view = *target_view;
        let threshold_n = threshold(self.f);
        let mut state = self.state.lock();
        if state.wish.is_none() || state.wish.as_ref().unwrap().target_view() != target_view {
            state.wish = Some(WishAggregator::new(target_view, threshold_n));
        }
        let reached = state.wish.as_mut().unwrap().record(msg.sender.clone());
        if !reached {
            return Ok(());
        }
        let signers = state.wish.as_ref().unwrap().signers().to_vec();
        drop(state);

        let wish_sigs = signers
            .into_iter()
            .map(|signer| SignedVote {
                signer,
                signature: Vec::new(),
            })
            .collect();
        self.outbox.send(ConsensusMessage::new(
            target_view,
            self.node_id.clone(),
            Recipient::Broadcast,
            Vec::new(),
            ConsensusPayload::TcMsg { target_view, wish_sigs },
        ));
        Ok(())
    }

    fn on_tc_msg(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::TcMsg { target_view, wish_sigs } = &msg.payload else {
            return Ok(());
        };
        if wish_sigs.len() < threshold(self.f) {
            return Ok(());
        }
        let leader_index = (*target_view % self.state.lock().view.cluster_size().max(1) as u64) as u32;
        let advanced = self.state.lock().view.update(*target_view, leader_index);
        if !advanced {
            return Ok(());
        }
        self.timer.lock().stop();
        let node_id = self.node_id.clone();
        let target_view = *target_view;
        self.enter_timer.lock().start(move || {
            warn!("hotstuff2: enter-timer fired for view {target_view} on {node_id}");
        });
        if self.is_leader() {
            let high_qc = self.state.lock().proposal_qc.clone();
            self.outbox.send(ConsensusMessage::new(
                target_view,
                self.node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::Enter { prepare_qc: high_qc },
            ));
        }
        Ok(())
    }

    fn on_enter(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Enter { prepare_qc } = &msg.payload else {
            return Ok(());
        };
        let leader_index = self.state.lock().view.leader_index();
        let advanced = self.state.lock().view.update(msg.view_number, leader_index);
        if !advanced {
            warn!("hotstuff2: rejecting ENTER that would rewind the view");
            return Ok(());
        }
        self.enter_timer.lock().stop();
        let mut state = self.state.lock();
        if prepare_qc.view_number > state.proposal_qc.view_number {
            state.proposal_qc = prepare_qc.clone();
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn collect(
    log: &Mutex<MessageLog>,
    signer: &ThresholdSigner,
    f: usize,
    kind: &'static str,
    view_number: u64,
    node: HsNode,
    certified_height: u64,
    qc_type: QcType,
    msg: ConsensusMessage,
) -> Option<QuorumCert> {
    let inserted = log.lock().insert(kind, view_number, Some(node.current_hash), msg);
    if !inserted {
        return None;
    }
    if !log.lock().has_quorum(kind, view_number, Some(node.current_hash), f) {
        return None;
    }
    let shares = log
        .lock()
        .messages(kind, view_number, Some(node.current_hash))
        .iter()
        .filter_map(|m| parse_share(&m.sig_share))
        .collect::<Vec<_>>();
    let bytes = node_signing_bytes(qc_type, view_number, &node);
    let agg = signer.combine(&shares, threshold(f)).ok()?;
    if !signer.verify_combined(&bytes, &agg) {
        warn!("hotstuff2: combined {kind} signature failed to verify");
        return None;
    }
    Some(QuorumCert::hs2(
        qc_type,
        view_number,
        node,
        certified_height,
        agg.point.to_compressed().to_vec(),
    ))
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
    fn leader_proposes_and_advances_phase() {
        let mut rng = rand::rngs::OsRng;
        let (pk, mut shares) = generate_shares(&mut rng, 3, 4).unwrap();
        let signer = Arc::new(ThresholdSigner::new(shares.remove(0), pk));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());

        let core = HotStuff2Core::new(NodeId::from("r_0"), 4, store, signer, Arc::new(NullOutbox));
        assert!(core.is_waiting_req());
        core.handle_req(0, Hash::empty(), Hash::empty(), vec![b"x".to_vec()]).unwrap();
    }

    struct RecordingOutbox {
        sent: Mutex<Vec<ConsensusMessage>>,
    }

    impl Outbox for RecordingOutbox {
        fn send(&self, msg: ConsensusMessage) {
            self.sent.lock().push(msg);
        }
    }

    /// spec.md §8 scenario 6: an ENTER carrying a valid `prepareQC` for view
    /// `v` lets a replica skip the WISH/TC_MSG exchange entirely and jump
    /// straight into `v`, with the enter-timer never armed since arming it
    /// only happens inside `on_tc_msg`, which this test never calls.
    #[test]
    fn enter_with_prepare_qc_skips_wish_and_enters_view_directly() {
        let mut rng = rand::rngs::OsRng;
        let (pk, mut shares) = generate_shares(&mut rng, 3, 4).unwrap();
        let signer = Arc::new(ThresholdSigner::new(shares.remove(0), pk));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let outbox = Arc::new(RecordingOutbox { sent: Mutex::new(Vec::new()) });

        let core = HotStuff2Core::new(NodeId::from("r_0"), 4, store, signer, outbox.clone());
        assert_eq!(core.view_number(), 0);

        let prepare_qc = QuorumCert::hs2(QcType::Hs2Prepare, 3, HsNode::genesis(), 0, Vec::new());
        let enter = ConsensusMessage::new(
            3,
            NodeId::from("r_1"),
            Recipient::Broadcast,
            Vec::new(),
            ConsensusPayload::Enter { prepare_qc },
        );
        core.handle_msg(enter).unwrap();

        assert_eq!(core.view_number(), 3, "ENTER should jump the view straight to v");
        assert!(core.state.lock().wish.is_none(), "no WISH round should have been started");
        assert_eq!(core.state.lock().proposal_qc.view_number, 3);

        // the leader for this view proceeds directly into PROPOSE, with no
        // intervening WISH/TC_MSG ever sent.
        assert!(core.is_leader());
        core.handle_req(0, Hash::empty(), Hash::empty(), vec![b"y".to_vec()]).unwrap();
        let sent = outbox.sent.lock();
        assert!(sent.iter().all(|m| !matches!(m.payload, ConsensusPayload::Wish { .. } | ConsensusPayload::TcMsg { .. })));
        assert!(sent.iter().any(|m| matches!(m.payload, ConsensusPayload::Propose { .. })));
    }
}
