//! Reverse tunnel server
//!
//! Clients behind NAT dial in once and keep a single control connection.
//! The server reads their tunnel declarations, claims hosts and binds public
//! ports for them, then pushes every public request or connection back down
//! that control connection.
//!
//! ```no_run
//! # async fn run() -> Result<(), nodegate_server::ServerError> {
//! use nodegate_server::{Server, ServerConfig};
//!
//! let config = ServerConfig::new("0.0.0.0:4443", "20000:21000").with_token("s3cret");
//! let server = Server::bind(config).await?;
//! server.start().await
//! # }
//! ```

pub mod config;
pub mod error;
mod handshake;
mod http;
pub mod listener;
mod provision;
mod server;
mod sni;

pub use config::{AuthHandler, ServerConfig, DEFAULT_HANDSHAKE_TIMEOUT};
pub use error::ServerError;
pub use server::Server;
