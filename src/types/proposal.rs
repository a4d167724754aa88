use serde::{Deserialize, Serialize};

use crate::types::hash::Hash;

/// `(height, view_number, prev_block_hash, root_hash, commands, signs)`
/// (spec.md §3). Empty proposal iff `commands`, `root_hash` and
/// `prev_block_hash` are all absent — used for the dummy blocks interleaved
/// between real commands (end-to-end scenario 2). Carries the proposer's
/// `timestamp_ms` so a receiving replica can rebuild the exact same `Block`
/// (and so the exact same content hash) the proposer signed over, rather
/// than stamping its own arrival time.
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct Proposal {
    pub height: u64,
    pub view_number: u64,
    pub prev_block_hash: Option<Hash>,
    pub root_hash: Option<Hash>,
    pub timestamp_ms: u64,
    pub commands: Vec<Vec<u8>>,
    pub signs: Vec<Vec<u8>>,
}

impl Proposal {
    pub fn new(
        height: u64,
        view_number: u64,
        prev_block_hash: Hash,
        root_hash: Hash,
        timestamp_ms: u64,
        commands: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            height,
            view_number,
            prev_block_hash: Some(prev_block_hash),
            root_hash: Some(root_hash),
            timestamp_ms,
            commands,
            signs: Vec::new(),
        }
    }

    pub fn empty(height: u64, view_number: u64) -> Self {
        Self {
            height,
            view_number,
            prev_block_hash: None,
            root_hash: None,
            timestamp_ms: 0,
            commands: Vec::new(),
            signs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.root_hash.is_none() && self.prev_block_hash.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_proposal_has_no_hashes() {
        let p = Proposal::empty(1, 0);
        assert!(p.is_empty());
        let p2 = Proposal::new(1, 0, Hash::zero(), Hash::empty(), 0, vec![b"x".to_vec()]);
        assert!(!p2.is_empty());
    }
}
