pub mod consensus;
pub mod envelope;
pub mod node_mgmt;

pub use consensus::{ConsensusMessage, ConsensusPayload};
pub use envelope::{EnvelopePayload, ServerEnvelope};
pub use node_mgmt::{NodeMgmtMessage, NodeMgmtPayload, ReconfigMode, ReconfigState, SyncProof};
