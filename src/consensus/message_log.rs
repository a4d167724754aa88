use std::collections::HashMap;

use crate::message::{ConsensusMessage, ConsensusPayload};
use crate::types::{Hash, NodeId, QuorumCert};

/// Per-view bucket of one message kind, keyed further by the hash the
/// message references (so conflicting digests for the same (view, kind)
/// don't get counted together). Messages are kept in first-seen order and
/// deduplicated by sender (spec.md §4.4, invariant 2: a replica votes at
/// most once per (view, phase)).
#[derive(Default)]
struct Bucket {
    by_sender: HashMap<NodeId, usize>,
    messages: Vec<ConsensusMessage>,
}

impl Bucket {
    fn insert(&mut self, msg: ConsensusMessage) -> bool {
        if self.by_sender.contains_key(&msg.sender) {
            return false;
        }
        self.by_sender.insert(msg.sender.clone(), self.messages.len());
        self.messages.push(msg);
        true
    }
}

/// Per-view buckets of typed consensus messages with quorum counting
/// (spec.md §4.4). `checkpoint_window` of `0` means unbounded growth, reset
/// on round advance via `gc_view` (the HotStuff variants' convention);
/// PBFT passes `CHECKPOINT_WINDOW` (10) and keys buckets by
/// `view_number mod window`, garbage-collecting older buckets at a stable
/// checkpoint.
pub struct MessageLog {
    checkpoint_window: u64,
    buckets: HashMap<(u64, &'static str, Option<Hash>), Bucket>,
}

impl MessageLog {
    pub fn new(checkpoint_window: u64) -> Self {
        Self {
            checkpoint_window,
            buckets: HashMap::new(),
        }
    }

    fn key(&self, view: u64) -> u64 {
        if self.checkpoint_window == 0 {
            view
        } else {
            view % self.checkpoint_window
        }
    }

    /// Record a message under `(kind, view, hash)`. Returns `true` if it was
    /// newly recorded (first time this sender voted this way this view).
    pub fn insert(&mut self, kind: &'static str, view: u64, hash: Option<Hash>, msg: ConsensusMessage) -> bool {
        let bucket_key = (self.key(view), kind, hash);
        self.buckets.entry(bucket_key).or_default().insert(msg)
    }

    pub fn count(&self, kind: &'static str, view: u64, hash: Option<Hash>) -> usize {
        self.buckets
            .get(&(self.key(view), kind, hash))
            .map(|b| b.messages.len())
            .unwrap_or(0)
    }

    pub fn messages(&self, kind: &'static str, view: u64, hash: Option<Hash>) -> &[ConsensusMessage] {
        self.buckets
            .get(&(self.key(view), kind, hash))
            .map(|b| b.messages.as_slice())
            .unwrap_or(&[])
    }

    /// Quorum counting rule: a bucket triggers the phase transition when it
    /// holds strictly more than `2f` distinct matching messages, i.e. `>=
    /// 2f+1` (spec.md §4.4, §6).
    pub fn has_quorum(&self, kind: &'static str, view: u64, hash: Option<Hash>, f: usize) -> bool {
        self.count(kind, view, hash) > 2 * f
    }

    /// Among `NEW_VIEW` messages logged for `view`, pick the one whose
    /// carried justify QC has the greatest `view_number`; ties break by
    /// first-seen (spec.md §4.4).
    pub fn highest_new_view_justify(&self, view: u64) -> Option<QuorumCert> {
        let msgs = self.messages("NEW_VIEW", view, None);
        let mut best: Option<&QuorumCert> = None;
        for msg in msgs {
            if let ConsensusPayload::NewView { justify: Some(qc) } = &msg.payload {
                let replace = match best {
                    None => true,
                    Some(b) => qc.view_number > b.view_number,
                };
                if replace {
                    best = Some(qc);
                }
            }
        }
        best.cloned()
    }

    /// Reset growth for a view that has concluded (HotStuff variants, on
    /// round advance).
    pub fn gc_view(&mut self, view: u64) {
        let key = self.key(view);
        self.buckets.retain(|(v, _, _), _| *v != key);
    }

    /// PBFT checkpoint GC: drop buckets for views below the new stable
    /// checkpoint's view window.
    pub fn gc_before(&mut self, stable_view: u64) {
        let boundary = self.key(stable_view);
        self.buckets.retain(|(v, _, _), _| *v >= boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, Recipient};

    fn vote(sender: &str, view: u64) -> ConsensusMessage {
        ConsensusMessage::new(
            view,
            NodeId::from(sender),
            Recipient::Broadcast,
            vec![],
            ConsensusPayload::PrepareVote,
        )
    }

    #[test]
    fn quorum_requires_more_than_2f() {
        let mut log = MessageLog::new(0);
        for r in ["r_0", "r_1", "r_2"] {
            log.insert("PREPARE_VOTE", 1, None, vote(r, 1));
        }
        // f=1 -> quorum is 3 (2f+1)
        assert!(!log.has_quorum("PREPARE_VOTE", 1, None, 1));
        log.insert("PREPARE_VOTE", 1, None, vote("r_3", 1));
        assert!(log.has_quorum("PREPARE_VOTE", 1, None, 1));
    }

    #[test]
    fn duplicate_sender_does_not_double_count() {
        let mut log = MessageLog::new(0);
        assert!(log.insert("PREPARE_VOTE", 1, None, vote("r_0", 1)));
        assert!(!log.insert("PREPARE_VOTE", 1, None, vote("r_0", 1)));
        assert_eq!(log.count("PREPARE_VOTE", 1, None), 1);
    }
}
