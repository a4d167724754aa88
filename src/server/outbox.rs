//! The `Outbox` a core sends through: a thin channel sender, nothing else.
//! Holding only the sender (not an `Arc<Server>`) is what breaks the
//! core<->Server reference cycle spec.md §9 calls out — the core never
//! references the Server that owns it.

use tokio::sync::mpsc;

use crate::message::ConsensusMessage;
use crate::protocol::Outbox;

pub struct ChannelOutbox {
    tx: mpsc::UnboundedSender<ConsensusMessage>,
}

impl ChannelOutbox {
    pub fn new(tx: mpsc::UnboundedSender<ConsensusMessage>) -> Self {
        Self { tx }
    }
}

impl Outbox for ChannelOutbox {
    fn send(&self, msg: ConsensusMessage) {
        let _ = self.tx.send(msg);
    }
}
