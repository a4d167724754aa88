//! Length-delimited TCP transport (spec.md §6): each frame is a 4-byte
//! little-endian length prefix followed by the raw `ServerEnvelope` JSON
//! bytes. Grounded byte-for-byte on the teacher's `network/transport.rs`
//! `read_message`/`write_message` pair. Node-to-node links are one dial per
//! direction: sending to a peer lazily dials and caches the write half;
//! receiving happens on whatever connection the peer dialed into this
//! node's listener. A failed cached write is treated as a dropped
//! connection and transparently redialed on the next send (spec.md §6
//! "TCP reconnect is transparent").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::types::NodeId;

use super::ServerTransport;

async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_frame(stream: &mut (impl tokio::io::AsyncWriteExt + Unpin), bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

pub struct TcpTransport {
    self_id: NodeId,
    peer_addrs: HashMap<NodeId, SocketAddr>,
    client_addr: SocketAddr,
    outbound: Mutex<HashMap<NodeId, OwnedWriteHalf>>,
    client_outbound: Mutex<Option<OwnedWriteHalf>>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl TcpTransport {
    /// Binds `listen_addr`, spawns the accept loop, and returns an `Arc`
    /// shared between the send path (callers) and the background task.
    pub async fn bind(
        self_id: NodeId,
        listen_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
        client_addr: SocketAddr,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            self_id,
            peer_addrs,
            client_addr,
            outbound: Mutex::new(HashMap::new()),
            client_outbound: Mutex::new(None),
            inbox_rx: Mutex::new(inbox_rx),
        });

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let tx = inbox_tx.clone();
                        tokio::spawn(async move {
                            let (mut reader, _writer) = stream.into_split();
                            loop {
                                match read_frame(&mut reader).await {
                                    Ok(bytes) => {
                                        if tx.send(bytes).is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                        });
                    }
                    Err(e) => warn!("tcp transport: accept failed: {e}"),
                }
            }
        });

        Ok(transport)
    }

    async fn dial(addr: SocketAddr) -> std::io::Result<OwnedWriteHalf> {
        let stream = TcpStream::connect(addr).await?;
        let (_reader, writer) = stream.into_split();
        Ok(writer)
    }
}

#[async_trait]
impl ServerTransport for TcpTransport {
    async fn send_to(&self, node: &NodeId, bytes: Vec<u8>) {
        let Some(&addr) = self.peer_addrs.get(node) else {
            warn!("tcp transport: {} has no known address for {}", self.self_id, node);
            return;
        };

        let mut outbound = self.outbound.lock().await;
        if let Some(writer) = outbound.get_mut(node) {
            if write_frame(writer, &bytes).await.is_ok() {
                return;
            }
            outbound.remove(node);
        }
        match Self::dial(addr).await {
            Ok(mut writer) => {
                if write_frame(&mut writer, &bytes).await.is_ok() {
                    outbound.insert(node.clone(), writer);
                } else {
                    warn!("tcp transport: write to freshly dialed {node} failed");
                }
            }
            Err(e) => warn!("tcp transport: dial to {node} at {addr} failed: {e}"),
        }
    }

    async fn send_client(&self, bytes: Vec<u8>) {
        let mut client = self.client_outbound.lock().await;
        if let Some(writer) = client.as_mut() {
            if write_frame(writer, &bytes).await.is_ok() {
                return;
            }
            *client = None;
        }
        match Self::dial(self.client_addr).await {
            Ok(mut writer) => {
                if write_frame(&mut writer, &bytes).await.is_ok() {
                    *client = Some(writer);
                }
            }
            Err(e) => warn!("tcp transport: dial to client at {} failed: {e}", self.client_addr),
        }
    }

    fn known_nodes(&self) -> Vec<NodeId> {
        self.peer_addrs.keys().cloned().collect()
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbox_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_loopback_pair() {
        let (mut client, server) = tokio::io::duplex(4096);
        let payload = b"envelope-bytes".to_vec();
        let expected = payload.clone();
        let handle = tokio::spawn(async move {
            let mut server = server;
            read_frame(&mut server).await.unwrap()
        });
        write_frame(&mut client, &payload).await.unwrap();
        let received = handle.await.unwrap();
        assert_eq!(received, expected);
    }
}
