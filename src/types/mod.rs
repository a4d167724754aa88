pub mod block;
pub mod hash;
pub mod node_id;
pub mod proposal;
pub mod quorum_cert;
pub mod request;
pub mod timestamp;
pub mod view;

pub use block::{Block, BlockData, BlockHeader, HsNode};
pub use hash::Hash;
pub use node_id::{NodeId, Recipient};
pub use proposal::Proposal;
pub use quorum_cert::{QcType, QuorumCert};
pub use request::BcRequest;
pub use timestamp::Timestamp;
pub use view::View;
