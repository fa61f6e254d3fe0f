use http::StatusCode;
use nodegate_proto::ProtoError;
use thiserror::Error;

/// Connection pool errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No connection for {0}")]
    NotFound(String),

    #[error("Connection {0} already registered")]
    DuplicateKey(String),

    #[error("Transport error: {0}")]
    Transport(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Http(#[from] http::Error),

    #[error("Peer answered {0}")]
    Status(StatusCode),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),
}
