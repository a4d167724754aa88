//! Transport abstraction (spec.md §6): one trait two implementations share —
//! an in-process channel transport for tests and local simulation, and a
//! length-delimited TCP transport for a real multi-process cluster.
//! Grounded on the teacher's `network/transport.rs` framing helpers,
//! generalized from its single hard-coded P2P stack to the small interface
//! spec.md needs: deliver a byte envelope to a named node, to the client, or
//! receive the next one.

pub mod channel;
pub mod tcp;

pub use channel::ChannelTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::types::NodeId;

/// What a Server needs from the network layer. Implementations carry
/// complete `ServerEnvelope` JSON bytes (spec.md §6); this trait is
/// deliberately payload-agnostic.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Deliver `bytes` to `node`. Best-effort: a transient failure (dropped
    /// peer, dial error) is logged and discarded (spec.md §7), never
    /// propagated, since quorum still forms from the honest majority.
    async fn send_to(&self, node: &NodeId, bytes: Vec<u8>);

    /// Deliver `bytes` to the first known client connection (the `"Client"`
    /// recipient sentinel).
    async fn send_client(&self, bytes: Vec<u8>);

    /// Every node this transport currently knows how to reach, for resolving
    /// `Broadcast`/`Gossip`.
    fn known_nodes(&self) -> Vec<NodeId>;

    /// Blocks until the next inbound envelope arrives. Returns `None` once
    /// the transport has been shut down.
    async fn recv(&self) -> Option<Vec<u8>>;
}
