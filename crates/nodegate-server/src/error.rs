use nodegate_connection::ConnectionError;
use nodegate_proto::ProtoError;
use nodegate_router::{PoolError, RegistryError};
use std::io;
use thiserror::Error;

/// Tunnel server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Authentication rejected")]
    Auth,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Address pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Server already started")]
    AlreadyStarted,
}

impl From<hyper::Error> for ServerError {
    fn from(e: hyper::Error) -> Self {
        ServerError::Transport(ConnectionError::Transport(e))
    }
}

impl From<http::Error> for ServerError {
    fn from(e: http::Error) -> Self {
        ServerError::Transport(ConnectionError::Http(e))
    }
}
