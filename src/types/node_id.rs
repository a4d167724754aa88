use serde::{Deserialize, Serialize};

/// Stable opaque replica name. Routing uses the `"r_<i>"` convention but
/// nothing in the core relies on the string being parseable.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn from_index(i: u32) -> Self {
        Self(format!("r_{i}"))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Sentinels recognised by envelope routing (spec.md §6).
pub const BROADCAST: &str = "Broadcast";
pub const GOSSIP: &str = "Gossip";
pub const CLIENT: &str = "Client";

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub enum Recipient {
    Broadcast,
    Gossip,
    Client,
    Node(NodeId),
}

impl Recipient {
    pub fn encode(&self) -> String {
        match self {
            Recipient::Broadcast => BROADCAST.to_string(),
            Recipient::Gossip => GOSSIP.to_string(),
            Recipient::Client => CLIENT.to_string(),
            Recipient::Node(id) => id.0.clone(),
        }
    }

    pub fn decode(s: &str) -> Self {
        match s {
            BROADCAST => Recipient::Broadcast,
            GOSSIP => Recipient::Gossip,
            CLIENT => Recipient::Client,
            other => Recipient::Node(NodeId(other.to_string())),
        }
    }
}
