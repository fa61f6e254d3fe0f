//! Byte-stream exchanges: tcp, unix and sni tunnels

use http::{Response, StatusCode};
use hyper::body::Incoming;
use nodegate_connection::body::full;
use nodegate_connection::{bridge, TunnelBody};
use nodegate_proto::ControlMessage;
use std::collections::HashMap;
use std::io;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

trait LocalIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LocalIo for T {}

/// Connect to a local target; paths and `unix:` addresses are Unix sockets
async fn dial_local(addr: &str) -> io::Result<Box<dyn LocalIo>> {
    let unix_path = addr
        .strip_prefix("unix:")
        .or_else(|| addr.starts_with('/').then_some(addr));

    match unix_path {
        #[cfg(unix)]
        Some(path) => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Some(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
        None => {
            let stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
    }
}

/// Answer a byte-stream exchange by piping it to the tunnel's local address
///
/// The local side is dialed before answering so an unreachable service
/// fails the exchange with `502` instead of an empty stream.
pub async fn serve_exchange(
    locals: &HashMap<String, String>,
    msg: ControlMessage,
    body: Incoming,
    shutdown: CancellationToken,
) -> Response<TunnelBody> {
    let Some(local_addr) = locals.get(&msg.forwarded_id) else {
        warn!(tunnel = %msg.forwarded_id, "Exchange for unknown tunnel");
        return status(StatusCode::NOT_FOUND, "unknown tunnel");
    };

    let mut local = match dial_local(local_addr).await {
        Ok(local) => local,
        Err(e) => {
            warn!(
                tunnel = %msg.forwarded_id,
                "Failed to connect to {}: {}", local_addr, e
            );
            return status(StatusCode::BAD_GATEWAY, "local service unreachable");
        }
    };

    debug!(
        tunnel = %msg.forwarded_id,
        remote = %msg.remote_addr,
        "Proxying to {}", local_addr
    );

    let (mut stream, outgoing) = bridge(body);
    let tunnel = msg.forwarded_id;

    tokio::spawn(async move {
        tokio::select! {
            result = copy_bidirectional(&mut stream, &mut local) => match result {
                Ok((up, down)) => debug!(tunnel = %tunnel, up, down, "Exchange finished"),
                Err(e) => debug!(tunnel = %tunnel, "Exchange aborted: {}", e),
            },
            _ = shutdown.cancelled() => debug!(tunnel = %tunnel, "Exchange cancelled"),
        }
    });

    Response::new(outgoing)
}

fn status(code: StatusCode, msg: &str) -> Response<TunnelBody> {
    let mut resp = Response::new(full(format!("{}\n", msg)));
    *resp.status_mut() = code;
    resp
}
