use serde::{Deserialize, Serialize};

/// A client transaction carried inside a block's `transactions` (spec.md §3).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BcRequest {
    pub client_id: String,
    pub cmd: Vec<u8>,
    pub client_sig: Vec<u8>,
}

impl BcRequest {
    pub fn new(client_id: impl Into<String>, cmd: Vec<u8>, client_sig: Vec<u8>) -> Self {
        Self {
            client_id: client_id.into(),
            cmd,
            client_sig,
        }
    }

    /// Opaque bytes as carried inside a `Block`'s transaction list.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("BcRequest always serializes")
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
