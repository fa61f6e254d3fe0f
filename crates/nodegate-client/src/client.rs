//! Dial loop and control-connection request handler

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use nodegate_connection::body::{empty, full};
use nodegate_connection::TunnelBody;
use nodegate_proto::{
    ControlMessage, Handshake, Protocol, Tunnel, HEADER_AUTH, HEADER_ERROR,
};
use rustls::pki_types::ServerName;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::Backoff;
use crate::http_proxy::{self, HttpProxy};
use crate::routes::{build_routes, HttpRoutes};
use crate::{tcp_proxy, ClientConfig, ClientError, TlsMaterial};

/// A second disconnect this soon after the previous one ends [`Client::start`]
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(20);

trait ControlIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlIo for T {}

/// How one control connection ended
enum Outcome {
    Rejected(String),
    Stopped,
    Closed(String),
}

/// Reverse tunnel client
pub struct Client {
    server_addr: String,
    tls: TlsMaterial,
    dial_timeout: Duration,
    id_name: String,
    dispatch: Arc<Dispatch>,
    backoff: Mutex<Box<dyn Backoff>>,
    shutdown: CancellationToken,
}

/// State shared by every request on a control connection
struct Dispatch {
    auth: HeaderValue,
    hello: Bytes,
    http_routes: Arc<HttpRoutes>,
    locals: HashMap<String, String>,
    proxy: HttpProxy,
}

impl Client {
    /// Validate `config` and build the dispatch tables
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        if config.server_addr.trim().is_empty() {
            return Err(ClientError::Config("server address is required".to_string()));
        }
        if config.auth_token.is_empty() {
            return Err(ClientError::Config("auth token is required".to_string()));
        }
        let auth = HeaderValue::from_str(&config.auth_token)
            .map_err(|_| ClientError::Config("auth token is not a valid header value".to_string()))?;
        let tls = config
            .tls
            .ok_or_else(|| ClientError::Config("TLS material is required".to_string()))?;
        if config.tunnels.is_empty() {
            return Err(ClientError::Config("at least one tunnel is required".to_string()));
        }
        if config.id_name.trim().is_empty() {
            return Err(ClientError::Config("client id is required".to_string()));
        }

        let (http_routes, locals) = build_routes(&config.tunnels)?;

        let tunnels: BTreeMap<String, Tunnel> = config
            .tunnels
            .iter()
            .map(|(name, decl)| (name.clone(), decl.to_tunnel()))
            .collect();
        let hello = Handshake::new(config.id_name.trim(), tunnels).to_bytes()?;

        Ok(Self {
            server_addr: config.server_addr.trim().to_string(),
            tls,
            dial_timeout: config.dial_timeout,
            id_name: config.id_name.trim().to_string(),
            dispatch: Arc::new(Dispatch {
                auth,
                hello: Bytes::from(hello),
                http_routes: Arc::new(http_routes),
                locals,
                proxy: HttpProxy::new(),
            }),
            backoff: Mutex::new(Box::new(config.backoff)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the reconnect policy
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Mutex::new(Box::new(backoff));
        self
    }

    /// Connect and serve until stopped, rejected or out of retries
    ///
    /// Dial failures are retried with the backoff policy. A dropped
    /// connection is redialed at once unless the previous drop happened
    /// within [`GRACE_PERIOD`], which ends the loop with
    /// [`ClientError::ConnectionCut`]. A rejection from the server is final.
    pub async fn start(&self) -> Result<(), ClientError> {
        let span = info_span!("client", id = %self.id_name, server = %self.server_addr);
        self.run().instrument(span).await
    }

    async fn run(&self) -> Result<(), ClientError> {
        let mut last_disconnect: Option<Instant> = None;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let last_error = match self.dial().await {
                Ok(io) => {
                    info!("Connected to tunnel server");
                    self.backoff().reset();

                    match self.serve(io).await {
                        Outcome::Stopped => return Ok(()),
                        Outcome::Rejected(reason) => {
                            error!("Server rejected the handshake: {}", reason);
                            return Err(ClientError::Rejected(reason));
                        }
                        Outcome::Closed(reason) => {
                            let now = Instant::now();
                            if let Some(previous) = last_disconnect {
                                if now.duration_since(previous) < GRACE_PERIOD {
                                    warn!("Disconnected again within {:?}", GRACE_PERIOD);
                                    return Err(ClientError::ConnectionCut);
                                }
                            }
                            last_disconnect = Some(now);
                            warn!("Disconnected from tunnel server: {}", reason);
                            continue;
                        }
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    e.to_string()
                }
            };

            let next = self.backoff().next_backoff();
            let Some(delay) = next else {
                return Err(ClientError::BackoffExhausted { last_error });
            };
            debug!("Redialing in {:?}", delay);

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Close the active connection and end [`Client::start`]
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(id = %self.id_name, "Stopping tunnel client");
            self.shutdown.cancel();
        }
    }

    async fn dial(&self) -> Result<Box<dyn ControlIo>, ClientError> {
        let dial_err = |reason: String| ClientError::Dial {
            addr: self.server_addr.clone(),
            reason,
        };

        let stream = timeout(self.dial_timeout, TcpStream::connect(&self.server_addr))
            .await
            .map_err(|_| dial_err("timed out".to_string()))?
            .map_err(|e| dial_err(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        match &self.tls {
            TlsMaterial::Insecure => Ok(Box::new(stream)),
            TlsMaterial::Rustls {
                config,
                server_name,
            } => {
                let name = ServerName::try_from(server_name.clone())
                    .map_err(|e| ClientError::Tls(format!("Invalid server name: {}", e)))?;
                let connector = TlsConnector::from(config.clone());
                let tls = timeout(self.dial_timeout, connector.connect(name, stream))
                    .await
                    .map_err(|_| dial_err("TLS handshake timed out".to_string()))?
                    .map_err(|e| dial_err(format!("TLS handshake failed: {}", e)))?;
                Ok(Box::new(tls))
            }
        }
    }

    /// Answer the server's requests on one connection until it ends
    async fn serve(&self, io: Box<dyn ControlIo>) -> Outcome {
        let rejection = Arc::new(Mutex::new(None::<String>));
        let conn_token = self.shutdown.child_token();

        let dispatch = self.dispatch.clone();
        let rejected = rejection.clone();
        let token = conn_token.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatch = dispatch.clone();
            let rejected = rejected.clone();
            let token = token.clone();
            async move { Ok::<_, Infallible>(dispatch.handle(req, &rejected, token).await) }
        });

        let conn = http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
            .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
            .serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let closed = tokio::select! {
            result = conn.as_mut() => match result {
                Ok(()) => "closed by server".to_string(),
                Err(e) => e.to_string(),
            },
            _ = self.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = timeout(Duration::from_secs(1), conn.as_mut()).await;
                conn_token.cancel();
                return Outcome::Stopped;
            }
        };
        conn_token.cancel();

        let reason = rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match reason {
            Some(reason) => Outcome::Rejected(reason),
            None => Outcome::Closed(closed),
        }
    }

    fn backoff(&self) -> MutexGuard<'_, Box<dyn Backoff>> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Dispatch {
    async fn handle(
        &self,
        mut req: Request<Incoming>,
        rejection: &Mutex<Option<String>>,
        token: CancellationToken,
    ) -> Response<TunnelBody> {
        if let Some(reason) = req.headers().get(HEADER_ERROR) {
            let reason = String::from_utf8_lossy(reason.as_bytes()).into_owned();
            *rejection.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
            return Response::new(empty());
        }

        if req.method() == Method::CONNECT {
            return self.hello(&mut req);
        }

        let msg = match ControlMessage::read_from_headers(req.headers()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Malformed control message: {}", e);
                let mut resp = Response::new(full(format!("{}\n", e)));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                return resp;
            }
        };

        match msg.forwarded_protocol {
            Protocol::Http => http_proxy::serve_exchange(
                self.proxy.clone(),
                self.http_routes.clone(),
                msg,
                req.into_body(),
            ),
            Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 | Protocol::Unix | Protocol::Sni => {
                tcp_proxy::serve_exchange(&self.locals, msg, req.into_body(), token).await
            }
        }
    }

    /// Answer the hello: token in a header, declarations on the upgraded stream
    fn hello(&self, req: &mut Request<Incoming>) -> Response<TunnelBody> {
        let on_upgrade = hyper::upgrade::on(req);
        let hello = self.hello.clone();

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let mut io = TokioIo::new(upgraded);
                    if let Err(e) = io.write_all(&hello).await {
                        warn!("Failed to send tunnel declarations: {}", e);
                    }
                    let _ = io.shutdown().await;
                    debug!("Hello sent ({} bytes)", hello.len());
                }
                Err(e) => warn!("Hello upgrade failed: {}", e),
            }
        });

        let mut resp = Response::new(empty());
        resp.headers_mut().insert(HEADER_AUTH, self.auth.clone());
        resp
    }
}
