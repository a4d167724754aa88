use serde::{Deserialize, Serialize};

use crate::types::{Block, Hash, NodeId, Proposal, QuorumCert, Recipient};

/// A single PBFT PREPARE (or COMMIT) vote recorded against a (view, seq,
/// digest) tuple, kept around so VIEW_CHANGE's `P` set and NEW_VIEW's replay
/// can reconstruct "prepared" proofs without re-deriving signatures.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SignedVote {
    pub signer: NodeId,
    pub signature: Vec<u8>,
}

/// Proof that a PBFT request was `prepared` at `(view, seq)`: the
/// PRE_PREPARE digest plus `2f` matching PREPARE votes (spec.md §4.8).
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PreparedProof {
    pub view: u64,
    pub seq: u64,
    pub digest: Hash,
    pub prepares: Vec<SignedVote>,
}

/// One `PRE_PREPARE` the new primary re-issues for a replayed sequence
/// number during PBFT's NEW_VIEW (`O` in spec.md §4.8); `digest` is `None`
/// when no view-change's `P` set proves a digest for that sequence.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct OEntry {
    pub seq: u64,
    pub digest: Option<Hash>,
    pub block: Option<Block>,
}

/// A single replica's VIEW_CHANGE vote: `(v+1, h, C, P)` (spec.md §4.8).
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ViewChangePayload {
    pub sender: NodeId,
    pub new_view: u64,
    pub stable_seq: u64,
    pub checkpoint_proof: Vec<SignedVote>,
    pub prepared: Vec<PreparedProof>,
}

/// Discriminates the typed payload carried by a `ConsensusMessage`
/// (spec.md §3, §4.5-§4.8). Variants are grouped by which core produces
/// them; several names are shared verbs (`NewView`, `Vote`) used across more
/// than one protocol with a payload shaped for that protocol's phase.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum ConsensusPayload {
    /// Basic & chained HotStuff: replica -> next leader, carrying the
    /// highest known justify QC.
    NewView { justify: Option<QuorumCert> },
    /// Basic HotStuff PREPARE: leader -> replicas, new block + justify QC.
    Prepare { proposal: Proposal, justify: Option<QuorumCert> },
    PrepareVote,
    PreCommit { qc: QuorumCert },
    PreCommitVote,
    Commit { qc: QuorumCert },
    CommitVote,
    Decide { qc: QuorumCert },

    /// Chained HotStuff: one message plays GENERIC + justify simultaneously.
    Generic { proposal: Proposal, justify: QuorumCert },
    GenericVote,

    /// HotStuff-2.
    Propose {
        proposal: Proposal,
        proposal_qc: Option<QuorumCert>,
    },
    Vote1,
    Hs2Prepare { qc: QuorumCert },
    Vote2,
    Wish { target_view: u64 },
    TcMsg {
        target_view: u64,
        wish_sigs: Vec<SignedVote>,
    },
    Enter { prepare_qc: QuorumCert },

    /// PBFT.
    PrePrepare { seq: u64, digest: Hash, block: Block },
    PbftPrepare { seq: u64, digest: Hash },
    PbftCommit { seq: u64, digest: Hash },
    Reply { seq: u64, result_digest: Hash },
    Checkpoint { seq: u64, digest: Hash },
    ViewChange(ViewChangePayload),
    NewViewPbft {
        new_view: u64,
        view_changes: Vec<ViewChangePayload>,
        pre_prepares: Vec<OEntry>,
    },
}

/// `ConsensusMessage` (spec.md §3): tagged union discriminated by payload,
/// carrying `view_number`, `sender`, `receiver` (may be a broadcast
/// sentinel), and a partial or combined signature over the type-specific
/// signed bytes of the payload.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ConsensusMessage {
    pub view_number: u64,
    pub sender: NodeId,
    pub receiver: Recipient,
    pub sig_share: Vec<u8>,
    pub payload: ConsensusPayload,
}

impl ConsensusMessage {
    pub fn new(
        view_number: u64,
        sender: NodeId,
        receiver: Recipient,
        sig_share: Vec<u8>,
        payload: ConsensusPayload,
    ) -> Self {
        Self {
            view_number,
            sender,
            receiver,
            sig_share,
            payload,
        }
    }

    /// A short discriminant string for log lines and message-log bucketing.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            ConsensusPayload::NewView { .. } => "NEW_VIEW",
            ConsensusPayload::Prepare { .. } => "PREPARE",
            ConsensusPayload::PrepareVote => "PREPARE_VOTE",
            ConsensusPayload::PreCommit { .. } => "PRE_COMMIT",
            ConsensusPayload::PreCommitVote => "PRE_COMMIT_VOTE",
            ConsensusPayload::Commit { .. } => "COMMIT",
            ConsensusPayload::CommitVote => "COMMIT_VOTE",
            ConsensusPayload::Decide { .. } => "DECIDE",
            ConsensusPayload::Generic { .. } => "GENERIC",
            ConsensusPayload::GenericVote => "GENERIC_VOTE",
            ConsensusPayload::Propose { .. } => "PROPOSE",
            ConsensusPayload::Vote1 => "VOTE1",
            ConsensusPayload::Hs2Prepare { .. } => "PREPARE",
            ConsensusPayload::Vote2 => "VOTE2",
            ConsensusPayload::Wish { .. } => "WISH",
            ConsensusPayload::TcMsg { .. } => "TC_MSG",
            ConsensusPayload::Enter { .. } => "ENTER",
            ConsensusPayload::PrePrepare { .. } => "PRE_PREPARE",
            ConsensusPayload::PbftPrepare { .. } => "PREPARE",
            ConsensusPayload::PbftCommit { .. } => "COMMIT",
            ConsensusPayload::Reply { .. } => "REPLY",
            ConsensusPayload::Checkpoint { .. } => "CHECKPOINT",
            ConsensusPayload::ViewChange(_) => "VIEW_CHANGE",
            ConsensusPayload::NewViewPbft { .. } => "NEW_VIEW",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HsNode;

    #[test]
    fn json_round_trip() {
        let msg = ConsensusMessage::new(
            3,
            NodeId::from("r_0"),
            Recipient::Broadcast,
            vec![1, 2, 3],
            ConsensusPayload::PreCommitVote,
        );
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: ConsensusMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.view_number, 3);
        assert_eq!(decoded.kind(), "PRE_COMMIT_VOTE");

        let node = HsNode::genesis();
        let qc = QuorumCert::single(crate::types::QcType::Commit, 1, node, vec![9]);
        let msg2 = ConsensusMessage::new(
            1,
            NodeId::from("r_1"),
            Recipient::Node(NodeId::from("r_2")),
            vec![],
            ConsensusPayload::Decide { qc },
        );
        let encoded2 = serde_json::to_vec(&msg2).unwrap();
        let decoded2: ConsensusMessage = serde_json::from_slice(&encoded2).unwrap();
        assert_eq!(decoded2.kind(), "DECIDE");
    }
}
