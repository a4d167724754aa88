use thiserror::Error;

/// Crate-wide error type. Every decode/verify failure the ordering subsystem
/// can hit in normal operation is represented here; consensus cores match on
/// these variants and decide whether to drop-and-log or propagate.
#[derive(Error, Debug)]
pub enum OrdererError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timer error: {0}")]
    Timer(String),

    #[error("node already started")]
    AlreadyStarted,

    #[error("node not running")]
    NotRunning,

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid threshold: {0} out of {1} total nodes")]
    InvalidThreshold(usize, usize),

    #[error("threshold signature combination failed")]
    ThresholdCombinationFailed,

    #[error("node management error: {0}")]
    NodeManagement(String),

    #[error("orderer not ready")]
    NotReady,
}

pub type Result<T> = std::result::Result<T, OrdererError>;
