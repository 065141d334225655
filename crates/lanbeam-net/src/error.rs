use lanbeam_shared::types::DeviceId;
use thiserror::Error;

/// Socket, channel and timeout failures. Never fatal; the caller decides
/// whether to retry.
#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error("Connection to {endpoint} timed out after {after_ms} ms")]
    Timeout { endpoint: String, after_ms: u64 },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No candidate endpoint accepted a connection")]
    AllCandidatesFailed,

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid connection offer: {0}")]
    InvalidOffer(String),

    #[error("Not connected to the registry")]
    LinkDown,
}

/// Failures of the handshake and of a running transfer session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A transfer with {0} is already active")]
    AlreadyActive(DeviceId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(DeviceId),

    #[error("Peer {0} cannot be reached through the registry")]
    NotRoutable(DeviceId),

    #[error("No pending request from {0}")]
    NoPendingRequest(DeviceId),

    #[error("Nothing to send")]
    EmptyTransfer,

    #[error("Failed to read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}
