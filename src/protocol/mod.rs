pub mod basic_hotstuff;
pub mod chained_hotstuff;
pub mod hotstuff2;
pub mod pbft;

use std::sync::Arc;

use crate::error::Result;
use crate::message::{ConsensusMessage, NodeMgmtMessage, SyncProof};
use crate::types::{Hash, NodeId};

pub use basic_hotstuff::BasicHotStuff;
pub use chained_hotstuff::ChainedHotStuff;
pub use hotstuff2::HotStuff2Core;
pub use pbft::Pbft;

/// Which of the four pluggable protocols an `Orderer` is running
/// (spec.md §1, CLI flag `-pr`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConsensusKind {
    BasicHotStuff,
    ChainedHotStuff,
    HotStuff2,
    Pbft,
}

impl ConsensusKind {
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "bh" => Some(Self::BasicHotStuff),
            "ch" => Some(Self::ChainedHotStuff),
            "h2" => Some(Self::HotStuff2),
            "pbft" => Some(Self::Pbft),
            _ => None,
        }
    }
}

/// The four cores share this small protocol contract (spec.md §9). Modeled
/// as an exhaustive match over a tagged variant rather than a trait-object
/// hierarchy: each core keeps its own phase-specific state, and the variant
/// is the only place that knows all four exist.
pub enum ProtocolCore {
    Basic(Arc<BasicHotStuff>),
    Chained(Arc<ChainedHotStuff>),
    Hs2(Arc<HotStuff2Core>),
    Pbft(Arc<Pbft>),
}

impl ProtocolCore {
    pub fn handle_msg(&self, msg: ConsensusMessage) -> Result<()> {
        match self {
            ProtocolCore::Basic(c) => c.handle_msg(msg),
            ProtocolCore::Chained(c) => c.handle_msg(msg),
            ProtocolCore::Hs2(c) => c.handle_msg(msg),
            ProtocolCore::Pbft(c) => c.handle_msg(msg),
        }
    }

    pub fn handle_req(&self, height: u64, prev_hash: Hash, cur_hash: Hash, reqs: Vec<Vec<u8>>) -> Result<()> {
        match self {
            ProtocolCore::Basic(c) => c.handle_req(height, prev_hash, cur_hash, reqs),
            ProtocolCore::Chained(c) => c.handle_req(height, prev_hash, cur_hash, reqs),
            ProtocolCore::Hs2(c) => c.handle_req(height, prev_hash, cur_hash, reqs),
            ProtocolCore::Pbft(c) => c.handle_req(height, prev_hash, cur_hash, reqs),
        }
    }

    pub fn is_leader(&self) -> bool {
        match self {
            ProtocolCore::Basic(c) => c.is_leader(),
            ProtocolCore::Chained(c) => c.is_leader(),
            ProtocolCore::Hs2(c) => c.is_leader(),
            ProtocolCore::Pbft(c) => c.is_leader(),
        }
    }

    pub fn is_waiting_req(&self) -> bool {
        match self {
            ProtocolCore::Basic(c) => c.is_waiting_req(),
            ProtocolCore::Chained(c) => c.is_waiting_req(),
            ProtocolCore::Hs2(c) => c.is_waiting_req(),
            ProtocolCore::Pbft(c) => c.is_waiting_req(),
        }
    }

    pub fn get_leader_name(&self) -> NodeId {
        match self {
            ProtocolCore::Basic(c) => c.get_leader_name(),
            ProtocolCore::Chained(c) => c.get_leader_name(),
            ProtocolCore::Hs2(c) => c.get_leader_name(),
            ProtocolCore::Pbft(c) => c.get_leader_name(),
        }
    }

    pub fn stop(&self) {
        match self {
            ProtocolCore::Basic(c) => c.stop(),
            ProtocolCore::Chained(c) => c.stop(),
            ProtocolCore::Hs2(c) => c.stop(),
            ProtocolCore::Pbft(c) => c.stop(),
        }
    }

    pub fn reset(&self) {
        match self {
            ProtocolCore::Basic(c) => c.reset(),
            ProtocolCore::Chained(c) => c.reset(),
            ProtocolCore::Hs2(c) => c.reset(),
            ProtocolCore::Pbft(c) => c.reset(),
        }
    }

    pub fn restart(&self) {
        match self {
            ProtocolCore::Basic(c) => c.restart(),
            ProtocolCore::Chained(c) => c.restart(),
            ProtocolCore::Hs2(c) => c.restart(),
            ProtocolCore::Pbft(c) => c.restart(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            ProtocolCore::Basic(c) => c.is_ready(),
            ProtocolCore::Chained(c) => c.is_ready(),
            ProtocolCore::Hs2(c) => c.is_ready(),
            ProtocolCore::Pbft(_) => true,
        }
    }

    pub fn update_cluster_size(&self, n: u32) {
        match self {
            ProtocolCore::Basic(c) => c.update_cluster_size(n),
            ProtocolCore::Chained(c) => c.update_cluster_size(n),
            ProtocolCore::Hs2(c) => c.update_cluster_size(n),
            ProtocolCore::Pbft(c) => c.update_cluster_size(n),
        }
    }

    pub fn add_sync_info(&self, msg: &NodeMgmtMessage) {
        match self {
            ProtocolCore::Basic(c) => c.add_sync_info(msg),
            ProtocolCore::Chained(c) => c.add_sync_info(msg),
            ProtocolCore::Hs2(c) => c.add_sync_info(msg),
            ProtocolCore::Pbft(c) => c.add_sync_info(msg),
        }
    }

    pub fn sync_info(&self, leader_index: u32) -> SyncProof {
        match self {
            ProtocolCore::Basic(c) => c.sync_info(leader_index),
            ProtocolCore::Chained(c) => c.sync_info(leader_index),
            ProtocolCore::Hs2(c) => c.sync_info(leader_index),
            ProtocolCore::Pbft(c) => c.sync_info(leader_index),
        }
    }

    pub fn next_height(&self) -> u64 {
        match self {
            ProtocolCore::Basic(c) => c.next_height(),
            ProtocolCore::Chained(c) => c.next_height(),
            ProtocolCore::Hs2(c) => c.next_height(),
            ProtocolCore::Pbft(c) => c.next_height(),
        }
    }

    pub fn view_number(&self) -> u64 {
        match self {
            ProtocolCore::Basic(c) => c.view_number(),
            ProtocolCore::Chained(c) => c.view_number(),
            ProtocolCore::Hs2(c) => c.view_number(),
            ProtocolCore::Pbft(c) => c.view_number(),
        }
    }

    pub fn leader_index(&self) -> u32 {
        match self {
            ProtocolCore::Basic(c) => c.leader_index(),
            ProtocolCore::Chained(c) => c.leader_index(),
            ProtocolCore::Hs2(c) => c.leader_index(),
            ProtocolCore::Pbft(c) => c.leader_index(),
        }
    }

    pub fn current_committed_block(&self) -> Option<crate::types::Block> {
        match self {
            ProtocolCore::Basic(c) => c.current_committed_block(),
            ProtocolCore::Chained(c) => c.current_committed_block(),
            ProtocolCore::Hs2(c) => c.current_committed_block(),
            ProtocolCore::Pbft(c) => c.current_committed_block(),
        }
    }

    pub fn sync_leader(&self, leader_index: u32) {
        match self {
            ProtocolCore::Basic(c) => c.sync_leader(leader_index),
            ProtocolCore::Chained(c) => c.sync_leader(leader_index),
            ProtocolCore::Hs2(c) => c.sync_leader(leader_index),
            ProtocolCore::Pbft(c) => c.sync_leader(leader_index),
        }
    }
}

/// Abstract outbox each core sends typed messages through. The Server
/// implements it; the core holds only this trait object, breaking the
/// core<->Server reference cycle the teacher's channel wiring has
/// (spec.md §9 "cyclic/weak references").
pub trait Outbox: Send + Sync {
    fn send(&self, msg: ConsensusMessage);
}
