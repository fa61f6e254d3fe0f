//! Reverse tunnel client
//!
//! Dials the tunnel server, announces its tunnels and then serves every
//! exchange the server pushes down the control connection by forwarding it
//! to a local service.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod routes;
mod tcp_proxy;
mod tls;

pub use backoff::{Backoff, ExponentialBackoff};
pub use client::{Client, GRACE_PERIOD};
pub use config::{ClientConfig, TlsMaterial};
pub use error::ClientError;
pub use http_proxy::{HttpProxy, ProxyError};
pub use routes::HttpRoutes;
pub use tls::ensure_crypto_provider;
