//! Keyed pool of HTTP/2 control channels

use http::{Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use nodegate_proto::ControlMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::body::{from_reader, TunnelBody};
use crate::error::ConnectionError;
use crate::stream::{copy_body, STREAM_BUFFER};

/// Called once per channel, after the channel is gone
pub type DisconnectFn = Arc<dyn Fn(&str) + Send + Sync>;

/// HTTP/2 settings for control channels
#[derive(Debug, Clone)]
pub struct ConnPoolConfig {
    /// PING interval; `None` disables keep-alive
    pub keep_alive_interval: Option<Duration>,
    /// How long to wait for a PING acknowledgement before closing
    pub keep_alive_timeout: Duration,
}

impl Default for ConnPoolConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(Duration::from_secs(30)),
            keep_alive_timeout: Duration::from_secs(20),
        }
    }
}

struct Channel {
    id: u64,
    sender: http2::SendRequest<TunnelBody>,
    cancel: CancellationToken,
}

type Channels = Arc<Mutex<HashMap<String, Channel>>>;

/// One multiplexed channel per connected client
///
/// The pool owns the driver task of every channel. Whichever way a channel
/// ends (peer close, I/O error, keep-alive timeout, [`ConnPool::delete_conn`]
/// or [`ConnPool::close_all`]) the driver removes it and then calls the
/// disconnect callback exactly once with its key.
pub struct ConnPool {
    channels: Channels,
    next_id: AtomicU64,
    config: ConnPoolConfig,
    on_disconnect: DisconnectFn,
}

impl ConnPool {
    /// Create an empty pool; `on_disconnect` runs once for every channel that ends
    pub fn new(config: ConnPoolConfig, on_disconnect: DisconnectFn) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            config,
            on_disconnect,
        }
    }

    /// Run the HTTP/2 client handshake over `io` and register it as `key`
    pub async fn add_conn<T>(&self, io: T, key: &str) -> Result<(), ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.channels().contains_key(key) {
            return Err(ConnectionError::DuplicateKey(key.to_string()));
        }

        let (sender, conn) = http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(self.config.keep_alive_interval)
            .keep_alive_timeout(self.config.keep_alive_timeout)
            .keep_alive_while_idle(true)
            .handshake::<_, TunnelBody>(TokioIo::new(io))
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut channels = self.channels();
            if channels.contains_key(key) {
                return Err(ConnectionError::DuplicateKey(key.to_string()));
            }
            channels.insert(
                key.to_string(),
                Channel {
                    id,
                    sender,
                    cancel: cancel.clone(),
                },
            );
        }

        let channels = self.channels.clone();
        let on_disconnect = self.on_disconnect.clone();
        let task_key = key.to_string();

        tokio::spawn(async move {
            let key = task_key;
            tokio::select! {
                result = conn => match result {
                    Ok(()) => debug!(key = %key, "Control channel closed by peer"),
                    Err(e) => warn!(key = %key, "Control channel failed: {}", e),
                },
                _ = cancel.cancelled() => debug!(key = %key, "Control channel closed locally"),
            }

            {
                let mut channels = channels.lock().unwrap_or_else(PoisonError::into_inner);
                if channels.get(&key).map(|c| c.id) == Some(id) {
                    channels.remove(&key);
                }
            }

            info!(key = %key, "Client disconnected");
            on_disconnect(&key);
        });

        debug!(key, "Control channel registered");
        Ok(())
    }

    /// Close and forget the channel for `key`
    ///
    /// The disconnect callback still fires, from the channel's driver task.
    pub fn delete_conn(&self, key: &str) -> bool {
        match self.channels().remove(key) {
            Some(channel) => {
                channel.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Close every channel
    pub fn close_all(&self) {
        let drained: Vec<Channel> = self.channels().drain().map(|(_, c)| c).collect();
        for channel in drained {
            channel.cancel.cancel();
        }
    }

    /// Whether a live channel is registered as `key`
    pub fn contains(&self, key: &str) -> bool {
        self.channels().contains_key(key)
    }

    /// Number of live channels
    pub fn len(&self) -> usize {
        self.channels().len()
    }

    /// True when no channel is registered
    pub fn is_empty(&self) -> bool {
        self.channels().is_empty()
    }

    /// Canonical URL addressing the client behind `key`
    pub fn url(key: &str) -> String {
        format!("http://{}/", key)
    }

    /// Authority-form URI for CONNECT requests to `key`
    pub fn connect_uri(key: &str) -> Result<Uri, ConnectionError> {
        Ok(Uri::builder().authority(key).build()?)
    }

    /// Handle for sending requests over the channel for `key`
    pub fn sender(&self, key: &str) -> Result<http2::SendRequest<TunnelBody>, ConnectionError> {
        self.channels()
            .get(key)
            .map(|c| c.sender.clone())
            .ok_or_else(|| ConnectionError::NotFound(key.to_string()))
    }

    /// Send one request to the client behind `key`
    pub async fn request(
        &self,
        key: &str,
        req: Request<TunnelBody>,
    ) -> Result<Response<Incoming>, ConnectionError> {
        let mut sender = self.sender(key)?;
        sender.ready().await?;
        Ok(sender.send_request(req).await?)
    }

    /// Open a proxied exchange described by `msg`
    ///
    /// Bytes written to the returned stream reach the client as the request
    /// body; the client's response body is read back from it.
    pub async fn open_stream(
        &self,
        key: &str,
        msg: &ControlMessage,
    ) -> Result<DuplexStream, ConnectionError> {
        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let mut req = Request::builder()
            .method(Method::PUT)
            .uri(Self::url(key))
            .body(from_reader(remote_read))?;
        msg.write_to_headers(req.headers_mut())?;

        let resp = self.request(key, req).await?;
        if resp.status() != StatusCode::OK {
            return Err(ConnectionError::Status(resp.status()));
        }

        tokio::spawn(copy_body(resp.into_body(), remote_write));
        Ok(local)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("channels", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
