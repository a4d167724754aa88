//! Basic (four-phase) HotStuff core (spec.md §4.5). Strictly sequential:
//! `NEW_VIEW -> PREPARE -> PRE_COMMIT -> COMMIT -> DECIDE -> NEW_VIEW`. The
//! leader drives each phase by aggregating `2f+1` votes into the next QC
//! tier; replicas respond to QC-carrying phase messages. Grounded on the
//! teacher's `protocol/hotstuff2.rs` task/channel/lock shape, generalized
//! back to the non-pipelined four-phase protocol `original_source`'s
//! `orderer/consensus/hotstuff/core/basic_hotstuff.go` implements.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::consensus::{MessageLog, Timer};
use crate::crypto::ThresholdSigner;
use crate::error::Result;
use crate::message::{ConsensusMessage, ConsensusPayload, NodeMgmtMessage, SyncProof};
use crate::storage::BlockStore;
use crate::types::{Hash, HsNode, NodeId, Proposal, QcType, QuorumCert, Recipient, View};

use super::Outbox;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    NewView,
    Prepare,
    PreCommit,
    Commit,
}

struct Mutable {
    view: View,
    phase: Phase,
    high_qc: QuorumCert,
    locked_qc: Option<QuorumCert>,
    current_node: HsNode,
    pending_height: u64,
    pending_prev_hash: Hash,
}

pub struct BasicHotStuff {
    node_id: NodeId,
    f: usize,
    block_store: Arc<BlockStore>,
    signer: Arc<ThresholdSigner>,
    outbox: Arc<dyn Outbox>,
    state: Arc<Mutex<Mutable>>,
    log: Mutex<MessageLog>,
    timer: Mutex<Timer>,
    handle_state: AtomicBool,
    req_state: AtomicBool,
    registered_members: AtomicU32,
}

fn threshold(f: usize) -> usize {
    2 * f + 1
}

impl BasicHotStuff {
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
            state: Arc::new(Mutex::new(Mutable {
                view: View::genesis(cluster_size),
                phase: Phase::NewView,
                high_qc: QuorumCert::single(QcType::Prepare, 0, genesis, Vec::new()),
                locked_qc: None,
                current_node: genesis,
                pending_height: 0,
                pending_prev_hash: Hash::empty(),
            })),
            log: Mutex::new(MessageLog::new(0)),
            timer: Mutex::new(Timer::new()),
            handle_state: AtomicBool::new(true),
            req_state: AtomicBool::new(true),
            registered_members: AtomicU32::new(cluster_size),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().view.leader_name() == self.node_id
    }

    pub fn is_waiting_req(&self) -> bool {
        self.is_leader() && self.state.lock().phase == Phase::NewView
    }

    pub fn get_leader_name(&self) -> NodeId {
        self.state.lock().view.leader_name()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().view.cluster_size() == self.registered_members.load(Ordering::SeqCst)
    }

    /// Height the next proposed block should carry, per the block store this
    /// core writes through (spec.md §4.10: the Server supplies this into
    /// `handle_req` since only the core holds the store).
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
        self.req_state.store(false, Ordering::SeqCst);
        self.timer.lock().stop();
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::NewView;
        self.log.lock().gc_view(state.view.view_number());
        self.handle_state.store(true, Ordering::SeqCst);
        self.req_state.store(true, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.reset();
        if self.is_leader() {
            if let Some(block) = self.block_store.current_proposal() {
                self.broadcast_prepare(block);
            }
        }
    }

    pub fn add_sync_info(&self, _msg: &NodeMgmtMessage) {
        // Sync state is applied by the NodeManager directly onto the block
        // store / view before `restart()` is called; nothing protocol-
        // specific to absorb here beyond that.
    }

    pub fn sync_info(&self, leader_index: u32) -> SyncProof {
        let state = self.state.lock();
        let qc = state.locked_qc.clone().unwrap_or_else(|| state.high_qc.clone());
        let _ = leader_index;
        SyncProof::HotStuffFamily(qc)
    }

    fn active(&self) -> bool {
        self.handle_state.load(Ordering::SeqCst)
    }

    fn safe_node(&self, node: &HsNode, justify: &QuorumCert, locked: &Option<QuorumCert>) -> bool {
        match locked {
            None => true,
            Some(locked_qc) => node.extends(&locked_qc.node()) || justify.view_number > locked_qc.view_number,
        }
    }

    /// Leader entry point: called by the Orderer once a request batch is
    /// ready and this replica is leader-and-waiting (spec.md §4.9, §4.10).
    pub fn handle_req(&self, height: u64, prev_hash: Hash, _cur_hash: Hash, reqs: Vec<Vec<u8>>) -> Result<()> {
        if !self.active() || !self.req_state.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.is_leader() {
            return Ok(());
        }
        let view_number = self.state.lock().view.view_number();
        let block = self
            .block_store
            .gen_new_block(view_number, reqs, Some(height));
        let _ = prev_hash;
        self.broadcast_prepare(block);
        Ok(())
    }

    fn broadcast_prepare(&self, block: crate::types::Block) {
        let mut state = self.state.lock();
        let node = block.node();
        state.current_node = node;
        state.phase = Phase::Prepare;
        let view_number = state.view.view_number();
        let justify = state.high_qc.clone();
        drop(state);

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
            ConsensusPayload::Prepare {
                proposal,
                justify: Some(justify),
            },
        ));
        self.arm_timer();
    }

    fn arm_timer(&self) {
        // Timer expiry advances the local view and unicasts a NEW_VIEW to
        // the post-rotation leader, carrying the highest known QC (spec.md
        // §4.5/§4.6 share this liveness shape).
        let node_id = self.node_id.clone();
        let outbox = self.outbox.clone();
        let state = self.state.clone();
        self.timer.lock().start(move || {
            let (new_view_number, new_leader, high_qc) = {
                let mut state = state.lock();
                state.view.next_view();
                (state.view.view_number(), state.view.leader_name(), state.high_qc.clone())
            };
            warn!("basic-hotstuff: view {} timed out on {node_id}", new_view_number - 1);
            outbox.send(ConsensusMessage::new(
                new_view_number,
                node_id.clone(),
                Recipient::Node(new_leader),
                Vec::new(),
                ConsensusPayload::NewView {
                    justify: Some(high_qc),
                },
            ));
        });
    }

    pub fn handle_msg(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        if msg.view_number < self.state.lock().view.view_number() {
            debug!("basic-hotstuff: dropping stale message from view {}", msg.view_number);
            return Ok(());
        }
        match &msg.payload {
            ConsensusPayload::NewView { .. } => self.on_new_view(msg),
            ConsensusPayload::Prepare { .. } => self.on_prepare(msg),
            ConsensusPayload::PrepareVote => self.on_prepare_vote(msg),
            ConsensusPayload::PreCommit { .. } => self.on_pre_commit(msg),
            ConsensusPayload::PreCommitVote => self.on_pre_commit_vote(msg),
            ConsensusPayload::Commit { .. } => self.on_commit(msg),
            ConsensusPayload::CommitVote => self.on_commit_vote(msg),
            ConsensusPayload::Decide { .. } => self.on_decide(msg),
            _ => Ok(()),
        }
    }

    fn on_new_view(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let view_number = self.state.lock().view.view_number();
        let inserted = self.log.lock().insert("NEW_VIEW", view_number, None, msg);
        if !inserted {
            return Ok(());
        }
        if self.log.lock().has_quorum("NEW_VIEW", view_number, None, self.f) {
            if let Some(qc) = self.log.lock().highest_new_view_justify(view_number) {
                self.state.lock().high_qc = qc;
            }
        }
        Ok(())
    }

    fn on_prepare(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Prepare { proposal, justify } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(()); // only the leader's PREPARE is accepted
        }
        let Some(justify) = justify.clone() else {
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
        if !node.extends(&justify.node()) {
            warn!("basic-hotstuff: PREPARE does not extend its justify, dropping");
            return Ok(());
        }
        let locked = self.state.lock().locked_qc.clone();
        if !self.safe_node(&node, &justify, &locked) {
            warn!("basic-hotstuff: unsafe PREPARE rejected");
            return Ok(());
        }
        self.block_store.adopt_proposal(block);

        {
            let mut state = self.state.lock();
            state.current_node = node;
            state.phase = Phase::Prepare;
            state.high_qc = justify.clone();
        }

        let share = self.signer.partial_sign(&node_signing_bytes(QcType::Prepare, msg.view_number, &node));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Node(self.get_leader_name()),
            share_bytes(&share),
            ConsensusPayload::PrepareVote,
        ));
        self.arm_timer();
        Ok(())
    }

    fn collect_votes_into_qc(
        &self,
        kind: &'static str,
        view_number: u64,
        node: HsNode,
        qc_type: QcType,
        msg: ConsensusMessage,
    ) -> Option<QuorumCert> {
        let inserted = self.log.lock().insert(kind, view_number, Some(node.current_hash), msg);
        if !inserted {
            return None;
        }
        if !self.log.lock().has_quorum(kind, view_number, Some(node.current_hash), self.f) {
            return None;
        }
        let shares = self.log.lock().messages(kind, view_number, Some(node.current_hash))
            .iter()
            .filter_map(|m| parse_share(&m.sig_share))
            .collect::<Vec<_>>();
        let bytes = node_signing_bytes(qc_type, view_number, &node);
        let agg = self.signer.combine(&shares, threshold(self.f)).ok()?;
        if !self.signer.verify_combined(&bytes, &agg) {
            warn!("basic-hotstuff: combined {kind} signature failed to verify");
            return None;
        }
        Some(QuorumCert::single(qc_type, view_number, node, agg.point.to_compressed().to_vec()))
    }

    fn on_prepare_vote(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let node = self.state.lock().current_node;
        let view_number = msg.view_number;
        if let Some(qc) = self.collect_votes_into_qc("PREPARE_VOTE", view_number, node, QcType::Prepare, msg) {
            self.state.lock().phase = Phase::PreCommit;
            self.outbox.send(ConsensusMessage::new(
                view_number,
                self.node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::PreCommit { qc },
            ));
        }
        Ok(())
    }

    fn on_pre_commit(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::PreCommit { qc } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            state.high_qc = qc.clone();
            state.current_node = qc.node();
            state.phase = Phase::PreCommit;
        }
        let share = self.signer.partial_sign(&node_signing_bytes(QcType::PreCommit, msg.view_number, &qc.node()));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Node(self.get_leader_name()),
            share_bytes(&share),
            ConsensusPayload::PreCommitVote,
        ));
        Ok(())
    }

    fn on_pre_commit_vote(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let node = self.state.lock().current_node;
        let view_number = msg.view_number;
        if let Some(qc) = self.collect_votes_into_qc("PRE_COMMIT_VOTE", view_number, node, QcType::PreCommit, msg) {
            self.state.lock().phase = Phase::Commit;
            self.outbox.send(ConsensusMessage::new(
                view_number,
                self.node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::Commit { qc },
            ));
        }
        Ok(())
    }

    fn on_commit(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Commit { qc } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            state.locked_qc = Some(qc.clone());
            state.current_node = qc.node();
            state.phase = Phase::Commit;
        }
        let share = self.signer.partial_sign(&node_signing_bytes(QcType::Commit, msg.view_number, &qc.node()));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Node(self.get_leader_name()),
            share_bytes(&share),
            ConsensusPayload::CommitVote,
        ));
        Ok(())
    }

    fn on_commit_vote(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let node = self.state.lock().current_node;
        let view_number = msg.view_number;
        if let Some(qc) = self.collect_votes_into_qc("COMMIT_VOTE", view_number, node, QcType::Commit, msg) {
            self.outbox.send(ConsensusMessage::new(
                view_number,
                self.node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::Decide { qc },
            ));
        }
        Ok(())
    }

    fn on_decide(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Decide { qc } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        self.timer.lock().stop();
        let Some(mut block) = self.block_store.current_proposal() else {
            return Ok(());
        };
        block.attach_validation(qc.aggregate_sig.clone());
        self.block_store.store_block(block)?;

        let mut state = self.state.lock();
        state.locked_qc = Some(qc.clone());
        state.high_qc = qc.clone();
        state.view.next_view();
        state.phase = Phase::NewView;
        let view_number = state.view.view_number();
        drop(state);
        self.log.lock().gc_view(view_number.saturating_sub(1));

        info!("basic-hotstuff: committed block at height {}", qc.certified_height.unwrap_or(0));
        if self.is_leader() {
            self.arm_timer();
        } else {
            let high_qc = self.state.lock().high_qc.clone();
            self.outbox.send(ConsensusMessage::new(
                view_number,
                self.node_id.clone(),
                Recipient::Node(self.get_leader_name()),
                Vec::new(),
                ConsensusPayload::NewView { justify: Some(high_qc) },
            ));
            self.arm_timer();
        }
        Ok(())
    }
}

pub(crate) fn node_signing_bytes(qc_type: QcType, view_number: u64, node: &HsNode) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(qc_type as u8);
    buf.extend_from_slice(&view_number.to_be_bytes());
    buf.extend_from_slice(node.current_hash.as_bytes());
    buf.extend_from_slice(node.parent_hash.as_bytes());
    buf
}

pub(crate) fn share_bytes(share: &crate::crypto::ThresholdSignatureShare) -> Vec<u8> {
    let mut buf = share.signer_index.to_be_bytes().to_vec();
    buf.extend_from_slice(&share.point.to_compressed());
    buf
}

pub(crate) fn parse_share(bytes: &[u8]) -> Option<crate::crypto::ThresholdSignatureShare> {
    if bytes.len() != 4 + 48 {
        return None;
    }
    let signer_index = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
    let mut arr = [0u8; 48];
    arr.copy_from_slice(&bytes[4..52]);
    let point = bls12_381::G1Affine::from_compressed(&arr).into_option()?;
    Some(crate::crypto::ThresholdSignatureShare { signer_index, point })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_shares;
    use std::sync::Mutex as StdMutex;

    struct TestOutbox {
        sent: StdMutex<Vec<ConsensusMessage>>,
    }
    impl Outbox for TestOutbox {
        fn send(&self, msg: ConsensusMessage) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    #[test]
    fn leader_proposes_on_request() {
        let mut rng = rand::rngs::OsRng;
        let (pk, mut shares) = generate_shares(&mut rng, 3, 4).unwrap();
        let share0 = shares.remove(0);
        let signer = Arc::new(ThresholdSigner::new(share0, pk));

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let outbox = Arc::new(TestOutbox { sent: StdMutex::new(Vec::new()) });

        let core = BasicHotStuff::new(NodeId::from("r_0"), 4, store, signer, outbox.clone());
        assert!(core.is_leader());
        assert!(core.is_waiting_req());

        core.handle_req(0, Hash::empty(), Hash::empty(), vec![b"Genesis block".to_vec()]).unwrap();
        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].payload, ConsensusPayload::Prepare { .. }));
    }
}
