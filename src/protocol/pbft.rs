//! PBFT core (spec.md §4.8): `PRE_PREPARE -> PREPARE -> COMMIT`, periodic
//! checkpoints, and `VIEW_CHANGE`/`NEW_VIEW` liveness. Unlike the HotStuff
//! family, votes carry per-replica Ed25519 signatures rather than threshold
//! shares — there is no fixed group key to aggregate into, only a quorum of
//! individually verifiable `SignedVote`s (spec.md §4.3). The `O` set a new
//! primary proposes in `NEW_VIEW` is recomputed independently by every
//! replica from the `view_change` multiset it was sent, rather than taking
//! the primary's claim on faith (SPEC_FULL.md open-question decision).
//! Grounded on `basic_hotstuff.rs`'s phase/vote-collection shape, adapted
//! from `original_source`'s `orderer/consensus/pbft/core/pbft.go`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::consensus::{MessageLog, Timer, CHECKPOINT_WINDOW};
use crate::crypto::IdentitySigner;
use crate::error::Result;
use crate::message::{
    ConsensusMessage, ConsensusPayload, NodeMgmtMessage, OEntry, PreparedProof, SignedVote, SyncProof,
    ViewChangePayload,
};
use crate::storage::BlockStore;
use crate::types::{Block, Hash, NodeId, Recipient, View};

use super::Outbox;

struct Mutable {
    view: View,
    stable_seq: u64,
    next_seq: u64,
    /// Blocks pre-prepared but not yet checkpointed, keyed by sequence.
    pending: HashMap<u64, Block>,
    /// `PreparedProof`s kept around to justify `VIEW_CHANGE`'s `P` set.
    prepared: HashMap<u64, PreparedProof>,
    view_change_votes: HashMap<NodeId, ViewChangePayload>,
}

pub struct Pbft {
    node_id: NodeId,
    f: usize,
    block_store: Arc<BlockStore>,
    identity: Arc<IdentitySigner>,
    outbox: Arc<dyn Outbox>,
    state: Mutex<Mutable>,
    log: Mutex<MessageLog>,
    timer: Mutex<Timer>,
    handle_state: AtomicBool,
    registered_members: AtomicU32,
    committed_seq: AtomicU64,
}

fn threshold(f: usize) -> usize {
    2 * f + 1
}

impl Pbft {
    pub fn new(
        node_id: NodeId,
        cluster_size: u32,
        block_store: Arc<BlockStore>,
        identity: Arc<IdentitySigner>,
        outbox: Arc<dyn Outbox>,
    ) -> Arc<Self> {
        let f = ((cluster_size as usize).saturating_sub(1)) / 3;
        let height = block_store.get_block_height();
        Arc::new(Self {
            node_id,
            f,
            block_store,
            identity,
            outbox,
            state: Mutex::new(Mutable {
                view: View::genesis(cluster_size),
                stable_seq: height,
                next_seq: height,
                pending: HashMap::new(),
                prepared: HashMap::new(),
                view_change_votes: HashMap::new(),
            }),
            log: Mutex::new(MessageLog::new(CHECKPOINT_WINDOW)),
            timer: Mutex::new(Timer::new()),
            handle_state: AtomicBool::new(true),
            registered_members: AtomicU32::new(cluster_size),
            committed_seq: AtomicU64::new(height),
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

    /// PBFT carries no reconfiguration-driven threshold rotation, so
    /// readiness is trivially true (mirrors `ProtocolCore::is_ready`'s
    /// hardcoded PBFT arm).
    pub fn is_ready(&self) -> bool {
        true
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
    }

    pub fn reset(&self) {
        let view_number = self.state.lock().view.view_number();
        self.log.lock().gc_view(view_number);
        self.handle_state.store(true, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.reset();
    }

    pub fn add_sync_info(&self, _msg: &NodeMgmtMessage) {}

    pub fn sync_info(&self, _leader_index: u32) -> SyncProof {
        let seq = self.committed_seq.load(Ordering::SeqCst);
        let signer = self.node_id.clone();
        SyncProof::Pbft {
            commits: vec![(signer, seq.to_be_bytes().to_vec())],
        }
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
        let digest = block.hash();
        let seq = height;

        {
            let mut state = self.state.lock();
            state.next_seq = state.next_seq.max(seq + 1);
            state.pending.insert(seq, block.clone());
        }

        self.outbox.send(ConsensusMessage::new(
            view_number,
            self.node_id.clone(),
            Recipient::Broadcast,
            self.identity.sign(&pre_prepare_bytes(view_number, seq, &digest)),
            ConsensusPayload::PrePrepare { seq, digest, block },
        ));
        self.arm_timer(view_number);
        Ok(())
    }

    fn arm_timer(&self, view_number: u64) {
        let node_id = self.node_id.clone();
        let outbox = self.outbox.clone();
        let stable_seq = self.state.lock().stable_seq;
        let checkpoint_proof = Vec::new();
        let prepared = self.state.lock().prepared.values().cloned().collect::<Vec<_>>();
        self.timer.lock().start(move || {
            warn!("pbft: view {view_number} timed out on {node_id}");
            outbox.send(ConsensusMessage::new(
                view_number + 1,
                node_id.clone(),
                Recipient::Broadcast,
                Vec::new(),
                ConsensusPayload::ViewChange(ViewChangePayload {
                    sender: node_id.clone(),
                    new_view: view_number + 1,
                    stable_seq,
                    checkpoint_proof: checkpoint_proof.clone(),
                    prepared: prepared.clone(),
                }),
            ));
        });
    }

    pub fn handle_msg(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        match &msg.payload {
            ConsensusPayload::PrePrepare { .. } => self.on_pre_prepare(msg),
            ConsensusPayload::PbftPrepare { .. } => self.on_prepare(msg),
            ConsensusPayload::PbftCommit { .. } => self.on_commit(msg),
            ConsensusPayload::Checkpoint { .. } => self.on_checkpoint(msg),
            ConsensusPayload::ViewChange(_) => self.on_view_change(msg),
            ConsensusPayload::NewViewPbft { .. } => self.on_new_view(msg),
            _ => Ok(()),
        }
    }

    fn on_pre_prepare(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::PrePrepare { seq, digest, block } = &msg.payload else {
            return Ok(());
        };
        if msg.sender != self.get_leader_name() {
            return Ok(());
        }
        if block.hash() != *digest {
            warn!("pbft: PRE_PREPARE digest does not match its block, dropping");
            return Ok(());
        }
        if !self
            .identity
            .verify(&msg.sender, &msg.sig_share, &pre_prepare_bytes(msg.view_number, *seq, digest))
        {
            warn!("pbft: PRE_PREPARE signature verification failed");
            return Ok(());
        }

        self.block_store.adopt_proposal(block.clone());
        self.state.lock().pending.insert(*seq, block.clone());

        let sig = self.identity.sign(&vote_bytes("PREPARE", msg.view_number, *seq, digest));
        self.outbox.send(ConsensusMessage::new(
            msg.view_number,
            self.node_id.clone(),
            Recipient::Broadcast,
            sig,
            ConsensusPayload::PbftPrepare {
                seq: *seq,
                digest: *digest,
            },
        ));
        self.arm_timer(msg.view_number);
        Ok(())
    }

    fn on_prepare(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::PbftPrepare { seq, digest } = &msg.payload else {
            return Ok(());
        };
        if !self
            .identity
            .verify(&msg.sender, &msg.sig_share, &vote_bytes("PREPARE", msg.view_number, *seq, digest))
        {
            return Ok(());
        }
        let view_number = msg.view_number;
        let seq = *seq;
        let digest = *digest;
        let inserted = self.log.lock().insert("PREPARE", view_number, Some(digest), msg.clone());
        if !inserted {
            return Ok(());
        }
        if !self.log.lock().has_quorum("PREPARE", view_number, Some(digest), self.f) {
            return Ok(());
        }

        let votes: Vec<SignedVote> = self
            .log
            .lock()
            .messages("PREPARE", view_number, Some(digest))
            .iter()
            .map(|m| SignedVote {
                signer: m.sender.clone(),
                signature: m.sig_share.clone(),
            })
            .collect();
        self.state.lock().prepared.insert(
            seq,
            PreparedProof {
                view: view_number,
                seq,
                digest,
                prepares: votes,
            },
        );

        let sig = self.identity.sign(&vote_bytes("COMMIT", view_number, seq, &digest));
        self.outbox.send(ConsensusMessage::new(
            view_number,
            self.node_id.clone(),
            Recipient::Broadcast,
            sig,
            ConsensusPayload::PbftCommit { seq, digest },
        ));
        Ok(())
    }

    fn on_commit(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::PbftCommit { seq, digest } = &msg.payload else {
            return Ok(());
        };
        if !self
            .identity
            .verify(&msg.sender, &msg.sig_share, &vote_bytes("COMMIT", msg.view_number, *seq, digest))
        {
            return Ok(());
        }
        let view_number = msg.view_number;
        let seq = *seq;
        let digest = *digest;
        let inserted = self.log.lock().insert("COMMIT", view_number, Some(digest), msg.clone());
        if !inserted {
            return Ok(());
        }
        if !self.log.lock().has_quorum("COMMIT", view_number, Some(digest), self.f) {
            return Ok(());
        }

        let validation_votes: Vec<SignedVote> = self
            .log
            .lock()
            .messages("COMMIT", view_number, Some(digest))
            .iter()
            .map(|m| SignedVote {
                signer: m.sender.clone(),
                signature: m.sig_share.clone(),
            })
            .collect();
        let expected_height = self.block_store.get_block_height();
        if seq != expected_height {
            // Out-of-order commit (gap fill happens during NEW_VIEW replay);
            // hold the sequence number but don't persist yet.
            return Ok(());
        }
        let Some(mut block) = self.state.lock().pending.remove(&seq) else {
            return Ok(());
        };
        block.attach_validation(serde_json::to_vec(&validation_votes)?);
        self.block_store.store_block(block)?;
        self.committed_seq.store(seq, Ordering::SeqCst);
        self.timer.lock().stop();
        info!("pbft: committed sequence {seq}");

        self.outbox.send(ConsensusMessage::new(
            view_number,
            self.node_id.clone(),
            Recipient::Client,
            Vec::new(),
            ConsensusPayload::Reply { seq, result_digest: digest },
        ));

        if seq > 0 && (seq + 1) % CHECKPOINT_WINDOW == 0 {
            let sig = self.identity.sign(&vote_bytes("CHECKPOINT", view_number, seq, &digest));
            self.outbox.send(ConsensusMessage::new(
                view_number,
                self.node_id.clone(),
                Recipient::Broadcast,
                sig,
                ConsensusPayload::Checkpoint { seq, digest },
            ));
        }
        Ok(())
    }

    fn on_checkpoint(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::Checkpoint { seq, digest } = &msg.payload else {
            return Ok(());
        };
        if !self
            .identity
            .verify(&msg.sender, &msg.sig_share, &vote_bytes("CHECKPOINT", msg.view_number, *seq, digest))
        {
            return Ok(());
        }
        let seq = *seq;
        let digest = *digest;
        let inserted = self.log.lock().insert("CHECKPOINT", seq, Some(digest), msg.clone());
        if !inserted {
            return Ok(());
        }
        if !self.log.lock().has_quorum("CHECKPOINT", seq, Some(digest), self.f) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if seq > state.stable_seq {
            state.stable_seq = seq;
            state.prepared.retain(|&s, _| s > seq);
        }
        drop(state);
        self.log.lock().gc_before(seq + 1);
        info!("pbft: checkpoint stable at sequence {seq}");
        Ok(())
    }

    fn on_view_change(&self, msg: ConsensusMessage) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        let ConsensusPayload::ViewChange(payload) = &msg.payload else {
            return Ok(());
        };
        let threshold_n = threshold(self.f);
        let mut state = self.state.lock();
        state.view_change_votes.insert(payload.sender.clone(), payload.clone());
        if state.view_change_votes.len() < threshold_n {
            return Ok(());
        }
        let votes: Vec<ViewChangePayload> = state.view_change_votes.values().cloned().collect();
        let new_view = payload.new_view;
        state.view_change_votes.clear();
        drop(state);

        let low = votes.iter().map(|v| v.stable_seq).min().unwrap_or(0);
        let high = votes
            .iter()
            .flat_map(|v| v.prepared.iter().map(|p| p.seq))
            .max()
            .unwrap_or(low);
        let pre_prepares = compute_oset(&votes, low, high);

        self.outbox.send(ConsensusMessage::new(
            new_view,
            self.node_id.clone(),
            Recipient::Broadcast,
            Vec::new(),
            ConsensusPayload::NewViewPbft {
                new_view,
                view_changes: votes,
                pre_prepares,
            },
        ));
        Ok(())
    }

    fn on_new_view(&self, msg: ConsensusMessage) -> Result<()> {
        let ConsensusPayload::NewViewPbft {
            new_view,
            view_changes,
            pre_prepares,
        } = &msg.payload
        else {
            return Ok(());
        };
        if view_changes.len() < threshold(self.f) {
            return Ok(());
        }
        let low = view_changes.iter().map(|v| v.stable_seq).min().unwrap_or(0);
        let high = view_changes
            .iter()
            .flat_map(|v| v.prepared.iter().map(|p| p.seq))
            .max()
            .unwrap_or(low);
        let expected = compute_oset(view_changes, low, high);
        if &expected != pre_prepares {
            warn!("pbft: NEW_VIEW's O set does not match independent reconstruction, rejecting");
            return Ok(());
        }

        let leader_index = (*new_view % self.state.lock().view.cluster_size().max(1) as u64) as u32;
        let advanced = self.state.lock().view.update(*new_view, leader_index);
        if !advanced {
            return Ok(());
        }
        self.timer.lock().stop();
        for entry in pre_prepares {
            if let Some(block) = &entry.block {
                self.state.lock().pending.insert(entry.seq, block.clone());
            }
        }
        info!("pbft: entered view {new_view} via NEW_VIEW");
        Ok(())
    }
}

/// Deterministic reconstruction of PBFT's `O` set (spec.md §4.8): for every
/// sequence in `(low, high]`, take the prepared certificate with the
/// highest view across all collected `VIEW_CHANGE`s, or a null request if
/// none certifies it. Every replica computes this independently rather
/// than trusting the new primary's claimed set.
fn compute_oset(view_changes: &[ViewChangePayload], low: u64, high: u64) -> Vec<OEntry> {
    let mut best: HashMap<u64, &PreparedProof> = HashMap::new();
    for vc in view_changes {
        for proof in &vc.prepared {
            let replace = match best.get(&proof.seq) {
                None => true,
                Some(existing) => proof.view > existing.view,
            };
            if replace {
                best.insert(proof.seq, proof);
            }
        }
    }
    let mut out = Vec::new();
    let mut seq = low + 1;
    while seq <= high {
        match best.get(&seq) {
            Some(proof) => out.push(OEntry {
                seq,
                digest: Some(proof.digest),
                block: None,
            }),
            None => out.push(OEntry {
                seq,
                digest: None,
                block: None,
            }),
        }
        seq += 1;
    }
    out
}

fn pre_prepare_bytes(view_number: u64, seq: u64, digest: &Hash) -> Vec<u8> {
    let mut buf = b"PRE_PREPARE".to_vec();
    buf.extend_from_slice(&view_number.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(digest.as_bytes());
    buf
}

fn vote_bytes(kind: &str, view_number: u64, seq: u64, digest: &Hash) -> Vec<u8> {
    let mut buf = kind.as_bytes().to_vec();
    buf.extend_from_slice(&view_number.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(digest.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId as Nid;

    struct NullOutbox;
    impl Outbox for NullOutbox {
        fn send(&self, _msg: ConsensusMessage) {}
    }

    #[test]
    fn leader_pre_prepares_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let identity = Arc::new(IdentitySigner::generate(Nid::from("r_0")));
        let core = Pbft::new(Nid::from("r_0"), 4, store, identity, Arc::new(NullOutbox));
        assert!(core.is_leader());
        assert!(core.is_ready());
        core.handle_req(0, Hash::empty(), Hash::empty(), vec![b"req".to_vec()]).unwrap();
        assert_eq!(core.state.lock().pending.len(), 1);
    }

    #[test]
    fn oset_prefers_highest_view_prepared_proof() {
        let digest = Hash::from_bytes(b"x");
        let vc1 = ViewChangePayload {
            sender: Nid::from("r_0"),
            new_view: 2,
            stable_seq: 0,
            checkpoint_proof: vec![],
            prepared: vec![PreparedProof {
                view: 1,
                seq: 1,
                digest,
                prepares: vec![],
            }],
        };
        let vc2 = ViewChangePayload {
            sender: Nid::from("r_1"),
            new_view: 2,
            stable_seq: 0,
            checkpoint_proof: vec![],
            prepared: vec![],
        };
        let oset = compute_oset(&[vc1, vc2], 0, 1);
        assert_eq!(oset.len(), 1);
        assert_eq!(oset[0].digest, Some(digest));
    }
}
