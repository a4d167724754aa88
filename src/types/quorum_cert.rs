use serde::{Deserialize, Serialize};

use crate::types::block::HsNode;
use crate::types::hash::Hash;

/// Discriminates what a `QuorumCertificate` certifies (spec.md §3). Basic
/// HotStuff walks `Prepare -> PreCommit -> Commit`; chained HotStuff uses a
/// single `Generic` tier; HotStuff-2 has `Proposal` (single-certified) and
/// `Prepare` (double-certified, commit-ready); PBFT uses `Commit` built from
/// a matching-message set rather than a threshold aggregate.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[repr(u8)]
pub enum QcType {
    Prepare = 0,
    PreCommit = 1,
    Commit = 2,
    Generic = 3,
    Hs2Proposal = 4,
    Hs2Prepare = 5,
    PbftCommit = 6,
}

/// `(qc_type, view_number, referenced_hsnode(s), aggregate_sig)` (spec.md
/// §3). Basic HotStuff and PBFT carry exactly one `HsNode`; chained HotStuff
/// carries the 4-deep sliding window; HotStuff-2 additionally stamps the
/// certified block height so the propose-time commit walk (§4.7) can find
/// the contiguous chain at that view.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct QuorumCert {
    pub qc_type: QcType,
    pub view_number: u64,
    pub nodes: Vec<HsNode>,
    pub certified_height: Option<u64>,
    pub aggregate_sig: Vec<u8>,
}

impl QuorumCert {
    pub fn single(qc_type: QcType, view_number: u64, node: HsNode, aggregate_sig: Vec<u8>) -> Self {
        Self {
            qc_type,
            view_number,
            nodes: vec![node],
            certified_height: None,
            aggregate_sig,
        }
    }

    pub fn chained(view_number: u64, window: [HsNode; 4], aggregate_sig: Vec<u8>) -> Self {
        Self {
            qc_type: QcType::Generic,
            view_number,
            nodes: window.to_vec(),
            certified_height: None,
            aggregate_sig,
        }
    }

    pub fn hs2(
        qc_type: QcType,
        view_number: u64,
        node: HsNode,
        certified_height: u64,
        aggregate_sig: Vec<u8>,
    ) -> Self {
        Self {
            qc_type,
            view_number,
            nodes: vec![node],
            certified_height: Some(certified_height),
            aggregate_sig,
        }
    }

    /// The block this QC most directly certifies — the head of the window
    /// for chained HotStuff, the sole node otherwise.
    pub fn node(&self) -> HsNode {
        *self.nodes.first().expect("QuorumCert always carries at least one node")
    }

    pub fn block_hash(&self) -> Hash {
        self.node().current_hash
    }

    /// Signed-content bytes for a QC: `qc_type‖view_number‖current_hash‖parent_hash`
    /// (spec.md §4.5, §9). Fixed positional concatenation, not a serde
    /// encoding — must match byte-for-byte across replicas.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let node = self.node();
        let mut buf = Vec::new();
        buf.push(self.qc_type as u8);
        buf.extend_from_slice(&self.view_number.to_be_bytes());
        buf.extend_from_slice(node.current_hash.as_bytes());
        buf.extend_from_slice(node.parent_hash.as_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_bytes_stable_shape() {
        let node = HsNode::new(Hash::from_bytes(b"a"), Hash::from_bytes(b"b"));
        let qc = QuorumCert::single(QcType::Prepare, 3, node, vec![]);
        let bytes = qc.signing_bytes();
        assert_eq!(bytes.len(), 1 + 8 + 32 + 32);
    }
}
