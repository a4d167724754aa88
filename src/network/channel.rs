//! In-process transport (tokio `mpsc`, one channel per ordered pair) used by
//! tests and local multi-replica simulation: no sockets, no serialization
//! round-trip beyond what the Server already does for signing.

use std::collections::HashMap;

use async_trait::async_trait;
use log::warn;
use tokio::sync::{mpsc, Mutex};

use crate::types::NodeId;

use super::ServerTransport;

pub struct ChannelTransport {
    self_id: NodeId,
    peers: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    client_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Builds one fully-connected `ChannelTransport` per id in `node_ids`,
    /// plus a receiver the test harness can poll for envelopes addressed to
    /// `"Client"`.
    pub fn cluster(node_ids: &[NodeId]) -> (HashMap<NodeId, ChannelTransport>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let mut senders = HashMap::new();
        let mut inboxes = HashMap::new();
        for id in node_ids {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(id.clone(), tx);
            inboxes.insert(id.clone(), rx);
        }

        let mut transports = HashMap::new();
        for id in node_ids {
            let inbox = inboxes.remove(id).expect("inbox created above for every id");
            transports.insert(
                id.clone(),
                ChannelTransport {
                    self_id: id.clone(),
                    peers: senders.clone(),
                    client_tx: client_tx.clone(),
                    inbox: Mutex::new(inbox),
                },
            );
        }
        (transports, client_rx)
    }
}

#[async_trait]
impl ServerTransport for ChannelTransport {
    async fn send_to(&self, node: &NodeId, bytes: Vec<u8>) {
        let Some(sender) = self.peers.get(node) else {
            warn!("channel transport: {} has no route to {}", self.self_id, node);
            return;
        };
        if sender.send(bytes).is_err() {
            warn!("channel transport: {} is no longer receiving", node);
        }
    }

    async fn send_client(&self, bytes: Vec<u8>) {
        let _ = self.client_tx.send(bytes);
    }

    fn known_nodes(&self) -> Vec<NodeId> {
        self.peers.keys().cloned().collect()
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbox.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_between_two_named_nodes() {
        let ids = vec![NodeId::from("r_0"), NodeId::from("r_1")];
        let (mut cluster, _client_rx) = ChannelTransport::cluster(&ids);
        let r0 = cluster.remove(&NodeId::from("r_0")).unwrap();
        let r1 = cluster.remove(&NodeId::from("r_1")).unwrap();

        r0.send_to(&NodeId::from("r_1"), b"hello".to_vec()).await;
        let received = r1.recv().await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn client_sentinel_reaches_shared_endpoint() {
        let ids = vec![NodeId::from("r_0")];
        let (cluster, mut client_rx) = ChannelTransport::cluster(&ids);
        let r0 = cluster.get(&NodeId::from("r_0")).unwrap();
        r0.send_client(b"reply".to_vec()).await;
        assert_eq!(client_rx.recv().await.unwrap(), b"reply");
    }
}
