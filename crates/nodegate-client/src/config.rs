//! Client configuration

use nodegate_proto::TunnelDeclaration;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::ExponentialBackoff;

/// How the control connection is secured
#[derive(Clone)]
pub enum TlsMaterial {
    /// TLS with the given client configuration
    Rustls {
        config: Arc<rustls::ClientConfig>,
        /// Name the server certificate must match
        server_name: String,
    },
    /// Plaintext, for development and tests
    Insecure,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMaterial::Rustls { server_name, .. } => f
                .debug_struct("Rustls")
                .field("server_name", server_name)
                .finish(),
            TlsMaterial::Insecure => f.write_str("Insecure"),
        }
    }
}

/// Everything needed to build a [`crate::Client`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control address of the tunnel server, `host:port`
    pub server_addr: String,
    /// Tunnels keyed by name
    pub tunnels: BTreeMap<String, TunnelDeclaration>,
    pub auth_token: String,
    pub tls: Option<TlsMaterial>,
    /// Stable identity of this client on the server
    pub id_name: String,
    pub backoff: ExponentialBackoff,
    pub dial_timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        server_addr: impl Into<String>,
        auth_token: impl Into<String>,
        id_name: impl Into<String>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            tunnels: BTreeMap::new(),
            auth_token: auth_token.into(),
            tls: None,
            id_name: id_name.into(),
            backoff: ExponentialBackoff::default(),
            dial_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_tunnel(mut self, name: impl Into<String>, tunnel: TunnelDeclaration) -> Self {
        self.tunnels.insert(name.into(), tunnel);
        self
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}
