use nodegate_proto::ProtoError;
use std::io;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server turned the handshake down; not retried
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Gave up reconnecting: {last_error}")]
    BackoffExhausted { last_error: String },

    /// Two disconnects inside the grace window
    #[error("Connection cut twice within the grace window")]
    ConnectionCut,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),
}
