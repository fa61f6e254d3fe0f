//! Public TLS passthrough entrypoint routed by ClientHello server name

use nodegate_proto::{ControlMessage, Protocol};
use nodegate_router::{client_hello_len, extract_sni};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::server::Shared;
use crate::{Server, ServerError};

/// Largest first record accepted while looking for the server name
const MAX_CLIENT_HELLO: usize = 16 * 1024 + 5;

const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

impl Server {
    /// Serve TLS passthrough on `listener` until the server stops
    pub async fn serve_sni(&self, listener: TcpListener) -> Result<(), ServerError> {
        let shared = self.shared().clone();
        let shutdown = shared.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(shared.clone().route_sni(stream, remote));
                    }
                    Err(e) => error!("Failed to accept SNI connection: {}", e),
                },
            }
        }
    }
}

impl Shared {
    async fn route_sni(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let hello = match timeout(CLIENT_HELLO_TIMEOUT, read_client_hello(&mut stream)).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                debug!(remote = %remote, "Unreadable ClientHello: {}", e);
                return;
            }
            Err(_) => {
                debug!(remote = %remote, "ClientHello timed out");
                return;
            }
        };

        let server_name = match extract_sni(&hello) {
            Ok(name) => name,
            Err(e) => {
                debug!(remote = %remote, "No usable SNI: {}", e);
                return;
            }
        };

        let route = match self.registry.subscriber(&server_name) {
            Some(route) if route.protocol == Protocol::Sni => route,
            _ => {
                debug!(sni = %server_name, "No tunnel for server name");
                return;
            }
        };

        let msg = ControlMessage::proxy(
            Protocol::Sni,
            server_name.as_str(),
            route.tunnel.as_str(),
            remote.to_string(),
        );

        let mut tunnel = match self.conns.open_stream(&route.client_id, &msg).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(sni = %server_name, "Failed to open exchange: {}", e);
                return;
            }
        };

        if let Err(e) = tunnel.write_all(&hello).await {
            debug!(sni = %server_name, "Failed to replay ClientHello: {}", e);
            return;
        }

        if let Err(e) = copy_bidirectional(&mut stream, &mut tunnel).await {
            debug!(sni = %server_name, "Exchange aborted: {}", e);
        }
    }
}

/// Read exactly the first TLS record off `stream`
async fn read_client_hello(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];

    loop {
        if let Some(needed) = client_hello_len(&buf) {
            if needed > MAX_CLIENT_HELLO {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "ClientHello record too large",
                ));
            }
            if buf.len() >= needed {
                return Ok(buf);
            }
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
