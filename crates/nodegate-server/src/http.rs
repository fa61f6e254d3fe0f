//! Public HTTP entrypoint routed by `Host`

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode, Uri, Version};
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use nodegate_connection::body::{boxed, full};
use nodegate_connection::{splice_upgrades, ConnectionError, TunnelBody};
use nodegate_proto::headers::{
    append_forwarded_for, bearer_token, remove_hop_by_hop, upgrade_protocol,
};
use nodegate_proto::{ControlMessage, Protocol};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

use crate::server::Shared;
use crate::{Server, ServerError};

impl Server {
    /// Forward one public HTTP request to the client owning its host
    ///
    /// Unknown hosts get `404`, a wrong per-host token `401` and any
    /// transport failure `502`. Upgrade requests (WebSocket) are spliced
    /// through once the local service answers `101`.
    pub async fn round_trip<B>(&self, req: Request<B>, remote: SocketAddr) -> Response<TunnelBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.shared().round_trip(req, remote).await
    }

    /// Serve public HTTP/1.1 on `listener` until the server stops
    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), ServerError> {
        let shared = self.shared().clone();
        let shutdown = shared.shutdown.clone();

        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                        continue;
                    }
                },
            };

            let shared = shared.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let shared = shared.clone();
                    async move { Ok::<_, Infallible>(shared.round_trip(req, remote).await) }
                });

                if let Err(e) = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!("HTTP connection from {} ended: {}", remote, e);
                }
            });
        }
    }
}

impl Shared {
    pub(crate) async fn round_trip<B>(
        self: &Arc<Self>,
        mut req: Request<B>,
        remote: SocketAddr,
    ) -> Response<TunnelBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let Some(host) = request_host(&req) else {
            return status(StatusCode::BAD_REQUEST, "missing host");
        };

        let route = match self.registry.subscriber(&host) {
            Some(route) if route.protocol == Protocol::Http => route,
            _ => {
                debug!(host = %host, "No tunnel for host");
                return status(StatusCode::NOT_FOUND, "no tunnel for host");
            }
        };

        if let Some(expected) = route.auth.as_deref() {
            if bearer_token(req.headers()) != Some(expected) {
                warn!(host = %host, remote = %remote, "Unauthorized request");
                return status(StatusCode::UNAUTHORIZED, "unauthorized");
            }
        }

        let downstream = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));
        let (mut parts, body) = req.into_parts();

        if route.auth.is_some() {
            parts.headers.remove(header::AUTHORIZATION);
        }

        remove_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, &remote.ip().to_string());
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert("x-forwarded-host", value.clone());
            parts.headers.entry(header::HOST).or_insert(value);
        }
        parts
            .headers
            .entry("x-forwarded-proto")
            .or_insert(HeaderValue::from_static("http"));

        // origin-form for the HTTP/1.1 hop
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);
        parts.version = Version::HTTP_11;

        let msg = ControlMessage::proxy(
            Protocol::Http,
            host.as_str(),
            route.tunnel.as_str(),
            remote.to_string(),
        );

        match self
            .forward_http(
                &route.client_id,
                msg,
                Request::from_parts(parts, boxed(body)),
                downstream,
            )
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(host = %host, client = %route.client_name, "Forwarding failed: {}", e);
                status(StatusCode::BAD_GATEWAY, "tunnel unavailable")
            }
        }
    }

    /// Send a request as HTTP/1.1 over one exchange on the client's channel
    ///
    /// `downstream` is the caller's pending upgrade; on `101` it is joined to
    /// the exchange for the rest of the connection.
    async fn forward_http(
        &self,
        key: &str,
        msg: ControlMessage,
        req: Request<TunnelBody>,
        downstream: Option<OnUpgrade>,
    ) -> Result<Response<TunnelBody>, ServerError> {
        let stream = self.conns.open_stream(key, &msg).await?;

        let (mut sender, conn) = http1::handshake::<_, TunnelBody>(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Tunnel HTTP exchange closed: {}", e);
            }
        });

        let mut resp = sender.send_request(req).await?;
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(downstream) = downstream else {
                return Err(ConnectionError::Status(resp.status()).into());
            };
            debug!(tunnel = %msg.forwarded_id, "Upgrading tunnel HTTP exchange");
            tokio::spawn(splice_upgrades(downstream, hyper::upgrade::on(&mut resp)));
        }

        let (mut parts, body) = resp.into_parts();
        remove_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, boxed(body)))
    }
}

/// Routing host of a request: `Host` header, else the URI authority
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.trim().is_empty())
}

fn status(code: StatusCode, message: &'static str) -> Response<TunnelBody> {
    let mut resp = Response::new(full(message));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
