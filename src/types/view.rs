use serde::{Deserialize, Serialize};

use crate::types::node_id::NodeId;

/// View number, leader index, and cluster-size arithmetic (spec.md §4.1).
///
/// Leader rotation during a live reconfiguration is NOT recomputed locally —
/// it is taken from the cross-replica quorum-chosen value carried in sync
/// messages (§4.11), via `update`, to avoid split leadership. `next_view`
/// rotates locally only during ordinary view-change, never during reconfig.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct View {
    view_number: u64,
    leader_index: u32,
    cluster_size: u32,
}

impl View {
    pub fn genesis(cluster_size: u32) -> Self {
        Self {
            view_number: 0,
            leader_index: 0,
            cluster_size,
        }
    }

    pub fn view_number(&self) -> u64 {
        self.view_number
    }

    pub fn leader_index(&self) -> u32 {
        self.leader_index
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn leader_name(&self) -> NodeId {
        NodeId::from_index(self.leader_index)
    }

    /// Advance the view and rotate the leader round-robin.
    pub fn next_view(&mut self) {
        self.view_number += 1;
        self.next_leader();
    }

    /// Rotate leader only, view number unchanged (used by PBFT view-change,
    /// which bumps the view separately).
    pub fn next_leader(&mut self) {
        if self.cluster_size > 0 {
            self.leader_index = (self.leader_index + 1) % self.cluster_size;
        }
    }

    /// Recompute `leader mod cluster_size` after a resize (exit ceremony).
    pub fn refresh_leader(&mut self) {
        if self.cluster_size > 0 {
            self.leader_index %= self.cluster_size;
        }
    }

    /// Forced sync to an externally agreed (view_number, leader_index),
    /// e.g. from a reconfiguration quorum. Monotonic: refuses to move the
    /// view number backward (REDESIGN FLAG — view rewinding is rejected).
    pub fn update(&mut self, view_number: u64, leader_index: u32) -> bool {
        if view_number < self.view_number {
            return false;
        }
        self.view_number = view_number;
        self.leader_index = leader_index;
        true
    }

    pub fn update_cluster_size(&mut self, n: u32) {
        self.cluster_size = n;
        self.refresh_leader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_round_robin() {
        let mut v = View::genesis(4);
        assert_eq!(v.leader_index(), 0);
        v.next_view();
        assert_eq!((v.view_number(), v.leader_index()), (1, 1));
        v.next_view();
        v.next_view();
        v.next_view();
        assert_eq!(v.leader_index(), 0);
    }

    #[test]
    fn update_rejects_rewind() {
        let mut v = View::genesis(4);
        v.update(5, 1);
        assert!(!v.update(3, 2));
        assert_eq!(v.view_number(), 5);
    }

    #[test]
    fn refresh_leader_after_resize() {
        let mut v = View::genesis(5);
        v.update(0, 4);
        v.update_cluster_size(4);
        assert_eq!(v.leader_index(), 0);
    }
}
