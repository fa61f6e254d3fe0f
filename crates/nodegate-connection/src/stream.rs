//! One proxied exchange seen as a plain duplex byte stream

use bytes::Bytes;
use hyper::body::Body;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::error::Error as StdError;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::{debug, trace};

use crate::body::{from_reader, into_reader, TunnelBody};

/// In-memory buffer between an exchange's body and its duplex stream
pub const STREAM_BUFFER: usize = 64 * 1024;

/// Copy a body's data into `writer`, then shut the writer down
pub async fn copy_body<B, W>(body: B, mut writer: W)
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
    W: AsyncWrite + Unpin,
{
    let mut reader = into_reader(body);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => trace!("Exchange body finished after {} bytes", n),
        Err(e) => trace!("Exchange body aborted: {}", e),
    }
    let _ = writer.shutdown().await;
}

/// Turn an incoming body into a duplex stream
///
/// Reads on the returned stream yield `incoming`'s bytes; writes come out of
/// the returned body. Dropping the stream ends the body and stops the copy.
pub fn bridge<B>(incoming: B) -> (DuplexStream, TunnelBody)
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
    let (remote_read, remote_write) = tokio::io::split(remote);

    tokio::spawn(copy_body(incoming, remote_write));

    (local, from_reader(remote_read))
}

/// Pipe bytes between both sides of an HTTP upgrade once each completes
///
/// `downstream` is the caller's connection, `upstream` the one that
/// answered `101 Switching Protocols`.
pub async fn splice_upgrades(downstream: OnUpgrade, upstream: OnUpgrade) {
    let (downstream, upstream) = match tokio::try_join!(downstream, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Upgrade did not complete: {}", e);
            return;
        }
    };

    let mut downstream = TokioIo::new(downstream);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((sent, received)) => trace!(sent, received, "Upgraded stream finished"),
        Err(e) => trace!("Upgraded stream aborted: {}", e),
    }
}
