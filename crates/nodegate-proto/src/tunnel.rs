//! Tunnel declarations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ProtoError, AUTO_PORT};

/// Forwarding protocol of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Host-routed HTTP, keyed by the `Host` header
    Http,
    /// Raw TCP on a public port (any address family)
    Tcp,
    /// Raw TCP bound to an IPv4 address
    Tcp4,
    /// Raw TCP bound to an IPv6 address
    Tcp6,
    /// Raw stream on a public Unix domain socket
    Unix,
    /// TLS passthrough routed by the ClientHello server name
    Sni,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Tcp4 => "tcp4",
            Protocol::Tcp6 => "tcp6",
            Protocol::Unix => "unix",
            Protocol::Sni => "sni",
        }
    }

    /// Whether the server answers this protocol by routing on a host name
    /// instead of binding a listener.
    pub fn is_host_routed(&self) -> bool {
        match self {
            Protocol::Http | Protocol::Sni => true,
            Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 | Protocol::Unix => false,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "tcp4" => Ok(Protocol::Tcp4),
            "tcp6" => Ok(Protocol::Tcp6),
            "unix" => Ok(Protocol::Unix),
            "sni" => Ok(Protocol::Sni),
            other => Err(ProtoError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Tunnel as advertised to the server in the handshake document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tunnel {
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default)]
    pub addr: String,
}

impl Tunnel {
    pub fn bind_addr(&self) -> BindAddr {
        BindAddr::parse(&self.addr)
    }
}

/// Full tunnel declaration held by a client
///
/// `local_address` never leaves the client; the server only sees the
/// [`Tunnel`] projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDeclaration {
    pub protocol: Protocol,
    /// Routing key for HTTP and SNI tunnels
    #[serde(default)]
    pub host: String,
    /// Where matched traffic goes on the client side
    /// (`http://127.0.0.1:8545` for HTTP, `127.0.0.1:30303` otherwise)
    pub local_address: String,
    /// Public bind address for TCP and Unix tunnels; port `AUTO` asks for
    /// a pool allocation
    #[serde(default)]
    pub remote_address: String,
    /// Bearer secret callers must present for this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl TunnelDeclaration {
    pub fn http(host: impl Into<String>, local_url: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Http,
            host: host.into(),
            local_address: local_url.into(),
            remote_address: String::new(),
            auth_token: None,
        }
    }

    pub fn tcp(local_address: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Tcp,
            host: String::new(),
            local_address: local_address.into(),
            remote_address: remote_address.into(),
            auth_token: None,
        }
    }

    pub fn sni(host: impl Into<String>, local_address: impl Into<String>) -> Self {
        Self {
            protocol: Protocol::Sni,
            host: host.into(),
            local_address: local_address.into(),
            remote_address: String::new(),
            auth_token: None,
        }
    }

    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Wire projection sent in the handshake
    pub fn to_tunnel(&self) -> Tunnel {
        Tunnel {
            protocol: self.protocol,
            host: self.host.clone(),
            auth: self.auth_token.clone(),
            addr: self.remote_address.clone(),
        }
    }
}

/// Parsed remote bind address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    /// Bind exactly this address (or socket path for Unix tunnels)
    Fixed(String),
    /// Bind `host` on a port taken from the address pool
    Auto { host: String },
}

impl BindAddr {
    pub fn parse(addr: &str) -> Self {
        match addr.rsplit_once(':') {
            Some((host, port)) if port.eq_ignore_ascii_case(AUTO_PORT) => BindAddr::Auto {
                host: host.to_string(),
            },
            _ => BindAddr::Fixed(addr.to_string()),
        }
    }

    /// Concrete address once a pool port is known
    pub fn with_port(&self, port: u16) -> String {
        match self {
            BindAddr::Fixed(addr) => addr.clone(),
            BindAddr::Auto { host } => format!("{}:{}", host, port),
        }
    }
}
