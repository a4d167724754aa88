use serde::{Deserialize, Serialize};

use crate::crypto::PublicKeyBytes;
use crate::types::{Block, NodeId, QuorumCert};

/// Mode of an in-flight reconfiguration ceremony (spec.md §4.11).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum ReconfigMode {
    None,
    Join,
    Exit,
}

/// State of the shared three-step ceremony, reused for both JOIN and EXIT
/// (grounded on `original_source` `mps/mgmt/mgmt_type.go`'s `Mode`/`State`
/// pair, modeled here as one small state machine rather than two parallel
/// structs per SPEC_FULL.md §4-supplement).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum ReconfigState {
    Inactive,
    Apply,
    Sync,
    Agree,
    Restart,
}

/// The binding certificate a SYNC reply carries so a joining replica can
/// pick an authoritative starting point: whichever QC tier the sender's
/// protocol core maintains.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum SyncProof {
    HotStuffFamily(QuorumCert),
    Pbft { commits: Vec<(NodeId, Vec<u8>)> },
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum NodeMgmtPayload {
    /// New/exiting replica -> everyone: "I want to join/leave", carrying the
    /// new replica's public keys (JOIN) or nothing extra (EXIT).
    Apply {
        mode: ReconfigMode,
        joining_node: NodeId,
        identity_public_key: Option<PublicKeyBytes>,
    },
    /// Existing replica -> joiner: current chain state and binding proof.
    Sync {
        view_number: u64,
        leader_index: u32,
        current_block: Block,
        proof: SyncProof,
        /// Existing identity public keys, carried explicitly so new PBFT
        /// members learn peer keys through the ceremony itself rather than
        /// out-of-band (SPEC_FULL.md open-question decision #3).
        identity_public_keys: Vec<(NodeId, PublicKeyBytes)>,
    },
    /// Remaining replica -> exiting replica: "agreed, you may leave".
    Agree,
    /// Joiner or exiter -> everyone: "apply the new membership and restart".
    Restart {
        mode: ReconfigMode,
        node: NodeId,
        leader_index: u32,
        cluster_size: u32,
    },
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct NodeMgmtMessage {
    pub sender: NodeId,
    pub payload: NodeMgmtPayload,
}
