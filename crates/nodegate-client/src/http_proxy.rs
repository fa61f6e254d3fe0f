//! HTTP reverse proxy towards local services
//!
//! Each HTTP exchange from the server carries a raw HTTP/1.1 connection.
//! The client serves it with hyper and forwards every request to the local
//! URL picked from the route table, reusing pooled keep-alive connections.
//! Upgrade requests get a dedicated local connection that is spliced to the
//! exchange once the local service answers `101`.

use http::header::{HeaderValue, HOST};
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response, StatusCode, Version};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use nodegate_connection::body::{boxed, full};
use nodegate_connection::{bridge, splice_upgrades, TunnelBody};
use nodegate_proto::headers::{remove_hop_by_hop, upgrade_protocol};
use nodegate_proto::ControlMessage;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::routes::HttpRoutes;

/// Maximum number of idle connections kept per local target
const MAX_POOL_SIZE: usize = 10;

type Sender = http1::SendRequest<TunnelBody>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("No local target for host {0:?}")]
    NoRoute(String),
}

/// Forwarder with one idle-connection pool per local authority
#[derive(Clone, Default)]
pub struct HttpProxy {
    pools: Arc<Mutex<HashMap<String, Vec<Sender>>>>,
}

impl HttpProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `req` to `target` and stream the local response back
    pub async fn forward(
        &self,
        target: &Uri,
        mut req: Request<Incoming>,
    ) -> Result<Response<TunnelBody>, ProxyError> {
        let authority = target
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| ProxyError::InvalidRequest(format!("{} has no authority", target)))?;

        let downstream = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let (mut parts, body) = req.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        parts.uri = local_uri(target, &parts.uri)?;
        parts.version = Version::HTTP_11;
        // local nodes often check the virtual host
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        parts.headers.insert(HOST, host);

        let mut sender = match downstream {
            // an upgraded connection never returns to the pool
            Some(_) => self.connect(&authority).await?,
            None => self.get_connection(&authority).await?,
        };
        let mut resp = sender
            .send_request(Request::from_parts(parts, boxed(body)))
            .await
            .map_err(|e| ProxyError::RequestFailed(e.to_string()))?;

        match downstream {
            Some(downstream) if resp.status() == StatusCode::SWITCHING_PROTOCOLS => {
                debug!("Upgrading connection to {}", authority);
                tokio::spawn(splice_upgrades(downstream, hyper::upgrade::on(&mut resp)));
            }
            Some(_) => {}
            None => {
                // The connection frees up once the response body has been read
                let proxy = self.clone();
                tokio::spawn(async move {
                    if sender.ready().await.is_ok() {
                        proxy.return_connection(&authority, sender).await;
                    }
                });
            }
        }

        let (mut parts, body) = resp.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, boxed(body)))
    }

    async fn get_connection(&self, authority: &str) -> Result<Sender, ProxyError> {
        {
            let mut pools = self.pools.lock().await;
            if let Some(pool) = pools.get_mut(authority) {
                while let Some(sender) = pool.pop() {
                    if sender.is_ready() {
                        debug!("Reusing pooled connection to {}", authority);
                        return Ok(sender);
                    }
                    debug!("Discarding stale connection from pool");
                }
            }
        }

        self.connect(authority).await
    }

    async fn connect(&self, authority: &str) -> Result<Sender, ProxyError> {
        debug!("Creating new connection to {}", authority);
        let stream = TcpStream::connect(authority).await.map_err(|e| {
            ProxyError::ConnectionFailed(format!("Failed to connect to {}: {}", authority, e))
        })?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("HTTP handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Local connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, authority: &str, sender: Sender) {
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(authority.to_string()).or_default();
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }

    #[cfg(test)]
    async fn idle_connections(&self, authority: &str) -> usize {
        self.pools
            .lock()
            .await
            .get(authority)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn handle(
        &self,
        routes: &HttpRoutes,
        forwarded_host: &str,
        req: Request<Incoming>,
    ) -> Response<TunnelBody> {
        let host = if forwarded_host.is_empty() {
            req.headers()
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_string()
        } else {
            forwarded_host.to_string()
        };

        let result = match routes.lookup(&host) {
            Some(target) => self.forward(target, req).await,
            None => Err(ProxyError::NoRoute(host.clone())),
        };

        result.unwrap_or_else(|e| {
            warn!(host = %host, "HTTP proxy failed: {}", e);
            bad_gateway(&e)
        })
    }
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy").finish_non_exhaustive()
    }
}

/// Answer an HTTP exchange from the server
///
/// The returned response carries the local responses back; the requests are
/// served from `body` on a background task.
pub fn serve_exchange(
    proxy: HttpProxy,
    routes: Arc<HttpRoutes>,
    msg: ControlMessage,
    body: Incoming,
) -> Response<TunnelBody> {
    let (stream, outgoing) = bridge(body);

    tokio::spawn(async move {
        let forwarded_host = Arc::new(msg.forwarded_host);
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let routes = routes.clone();
            let forwarded_host = forwarded_host.clone();
            async move { Ok::<_, Infallible>(proxy.handle(&routes, &forwarded_host, req).await) }
        });

        if let Err(e) = server_http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!(tunnel = %msg.forwarded_id, "HTTP exchange ended: {}", e);
        }
    });

    Response::new(outgoing)
}

fn bad_gateway(err: &ProxyError) -> Response<TunnelBody> {
    let mut resp = Response::new(full(format!("{}\n", err)));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

/// Join the local base path with the request's path and query
fn local_uri(target: &Uri, requested: &Uri) -> Result<Uri, ProxyError> {
    let base = target.path().trim_end_matches('/');
    let path_and_query = requested
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");

    let joined = if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    };

    joined
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("Bad request target {:?}: {}", joined, e)))
}
