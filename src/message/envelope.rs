use serde::{Deserialize, Serialize};

use crate::message::consensus::ConsensusMessage;
use crate::message::node_mgmt::NodeMgmtMessage;
use crate::types::{NodeId, Recipient};

/// Discriminates the payload carried by a `ServerEnvelope` (spec.md §3, §6).
#[derive(Clone, Serialize, Deserialize, Debug)]
pub enum EnvelopePayload {
    Request(Vec<u8>),
    NodeMgmt(NodeMgmtMessage),
    Order(ConsensusMessage),
}

/// `(stype, send_server, recv_server, envelope_sig, payload_bytes)`
/// (spec.md §3, §6). The envelope signature is over `payload_bytes` using
/// the sender's identity key; `recv_server` may be a `Recipient` sentinel.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ServerEnvelope {
    pub send_server: NodeId,
    pub recv_server: Recipient,
    pub envelope_sig: Vec<u8>,
    pub payload: EnvelopePayload,
}

impl ServerEnvelope {
    pub fn payload_bytes(payload: &EnvelopePayload) -> Vec<u8> {
        serde_json::to_vec(payload).expect("EnvelopePayload always serializes")
    }

    pub fn new_signed(
        send_server: NodeId,
        recv_server: Recipient,
        payload: EnvelopePayload,
        sign: impl FnOnce(&[u8]) -> Vec<u8>,
    ) -> Self {
        let bytes = Self::payload_bytes(&payload);
        let envelope_sig = sign(&bytes);
        Self {
            send_server,
            recv_server,
            envelope_sig,
            payload,
        }
    }

    pub fn verify(&self, verify: impl FnOnce(&NodeId, &[u8], &[u8]) -> bool) -> bool {
        let bytes = Self::payload_bytes(&self.payload);
        verify(&self.send_server, &self.envelope_sig, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let env = ServerEnvelope {
            send_server: NodeId::from("r_0"),
            recv_server: Recipient::Broadcast,
            envelope_sig: vec![1, 2, 3],
            payload: EnvelopePayload::Request(b"r hello".to_vec()),
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let decoded: ServerEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.send_server, NodeId::from("r_0"));
    }
}
