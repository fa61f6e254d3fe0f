//! Protocol errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid value for header {0}")]
    InvalidHeader(&'static str),

    #[error("Handshake body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("Handshake declares no tunnels")]
    NoTunnels,

    #[error("Handshake is missing the client name")]
    MissingIdName,

    #[error("Invalid handshake document: {0}")]
    Json(#[from] serde_json::Error),
}
