//! Public sockets bound on behalf of TCP and Unix tunnels

use nodegate_proto::Protocol;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpListener};
use tracing::debug;

use crate::ServerError;

/// Byte stream accepted on a public listener
pub trait PublicIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PublicIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type PublicStream = Box<dyn PublicIo>;

/// A bound public listener
pub enum PublicListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocket),
}

impl PublicListener {
    /// Bind a TCP listener, restricted to one address family for `tcp4`/`tcp6`
    pub async fn bind_tcp(addr: &str, protocol: Protocol) -> Result<Self, ServerError> {
        let addr = with_default_host(addr, protocol);
        let bind_err = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };

        let candidates: Vec<SocketAddr> = lookup_host(addr.as_str())
            .await
            .map_err(bind_err)?
            .filter(|candidate| match protocol {
                Protocol::Tcp4 => candidate.is_ipv4(),
                Protocol::Tcp6 => candidate.is_ipv6(),
                _ => true,
            })
            .collect();

        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {} address for {}", protocol, addr),
        );
        for candidate in candidates {
            match TcpListener::bind(candidate).await {
                Ok(listener) => {
                    debug!("Bound public listener on {}", candidate);
                    return Ok(PublicListener::Tcp(listener));
                }
                Err(e) => last_err = e,
            }
        }

        Err(bind_err(last_err))
    }

    /// Bind a Unix domain socket at `path`
    #[cfg(unix)]
    pub fn bind_unix(path: &str) -> Result<Self, ServerError> {
        if path.trim().is_empty() {
            return Err(ServerError::Config("unix tunnel needs a socket path".to_string()));
        }

        let listener = tokio::net::UnixListener::bind(path).map_err(|source| ServerError::Bind {
            addr: path.to_string(),
            source,
        })?;
        debug!("Bound public unix socket {}", path);

        Ok(PublicListener::Unix(UnixSocket {
            listener,
            path: path.into(),
        }))
    }

    #[cfg(not(unix))]
    pub fn bind_unix(path: &str) -> Result<Self, ServerError> {
        Err(ServerError::Config(format!(
            "unix tunnels are not supported on this platform ({})",
            path
        )))
    }

    /// Address as reported to logs and control messages
    pub fn local_addr(&self) -> String {
        match self {
            PublicListener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            #[cfg(unix)]
            PublicListener::Unix(socket) => socket.path.display().to_string(),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            PublicListener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            #[cfg(unix)]
            PublicListener::Unix(_) => None,
        }
    }

    pub async fn accept(&self) -> io::Result<(PublicStream, String)> {
        match self {
            PublicListener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), remote.to_string()))
            }
            #[cfg(unix)]
            PublicListener::Unix(socket) => {
                let (stream, _) = socket.listener.accept().await?;
                Ok((Box::new(stream), socket.path.display().to_string()))
            }
        }
    }
}

/// Unix listener that unlinks its socket file when dropped
#[cfg(unix)]
pub struct UnixSocket {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Drop for UnixSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Fill in the wildcard host for addresses like `:7000`
fn with_default_host(addr: &str, protocol: Protocol) -> String {
    if addr.starts_with(':') {
        let host = match protocol {
            Protocol::Tcp6 => "[::]",
            _ => "0.0.0.0",
        };
        format!("{}{}", host, addr)
    } else {
        addr.to_string()
    }
}
