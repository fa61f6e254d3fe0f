//! Hello exchange run once per control connection

use http::header::HeaderValue;
use http::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use nodegate_connection::body::empty;
use nodegate_connection::ConnPool;
use nodegate_proto::{Handshake, HEADER_AUTH, HEADER_ERROR, MAX_HANDSHAKE_BODY};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, Span};

use crate::server::Shared;
use crate::ServerError;

/// Upper bound for delivering a rejection before the channel is dropped
const REJECT_TIMEOUT: Duration = Duration::from_secs(2);

impl Shared {
    /// Ask the client for its tunnels, authenticate it and provision them
    ///
    /// Returns the client's declared name.
    pub(crate) async fn handshake(self: &Arc<Self>, key: &str) -> Result<String, ServerError> {
        let (token, hello) = timeout(self.config.handshake_timeout, self.request_hello(key))
            .await
            .map_err(|_| ServerError::Timeout("hello exchange"))??;

        let authorized = match &self.config.auth {
            Some(auth) => auth(&token),
            None => false,
        };
        if !authorized {
            return Err(ServerError::Auth);
        }

        let name = hello.id_name;
        Span::current().record("client", name.as_str());
        debug!(tunnels = hello.tunnels.len(), "Hello received");

        self.registry.subscribe(&name, key)?;
        self.provision(&name, key, &hello.tunnels).await?;

        Ok(name)
    }

    /// Send the CONNECT hello and read back the token and tunnel document
    async fn request_hello(&self, key: &str) -> Result<(String, Handshake), ServerError> {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri(ConnPool::connect_uri(key)?)
            .body(empty())?;

        let resp = self.conns.request(key, req).await?;
        if resp.status() != StatusCode::OK {
            return Err(ServerError::Handshake(format!(
                "hello answered with {}",
                resp.status()
            )));
        }

        let token = resp
            .headers()
            .get(HEADER_AUTH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServerError::Handshake("missing auth header".to_string()))?;

        let upgraded = hyper::upgrade::on(resp).await?;
        let mut body = Vec::new();
        TokioIo::new(upgraded)
            .take(MAX_HANDSHAKE_BODY + 1)
            .read_to_end(&mut body)
            .await?;

        Ok((token, Handshake::from_slice(&body)?))
    }

    /// Best-effort notice telling the client why it was turned away
    pub(crate) async fn reject(&self, key: &str, reason: &ServerError) {
        let value = HeaderValue::from_str(&header_safe(&reason.to_string()))
            .unwrap_or_else(|_| HeaderValue::from_static("handshake rejected"));

        let req = match ConnPool::connect_uri(key)
            .map_err(ServerError::from)
            .and_then(|uri| {
                Request::builder()
                    .method(Method::CONNECT)
                    .uri(uri)
                    .header(HEADER_ERROR, value)
                    .body(empty())
                    .map_err(ServerError::from)
            }) {
            Ok(req) => req,
            Err(e) => {
                debug!("Could not build rejection: {}", e);
                return;
            }
        };

        match timeout(REJECT_TIMEOUT, self.conns.request(key, req)).await {
            Ok(Ok(_)) => debug!("Rejection delivered"),
            Ok(Err(e)) => debug!("Rejection not delivered: {}", e),
            Err(_) => debug!("Rejection timed out"),
        }
    }
}

/// Keep only characters that survive as a header value
fn header_safe(reason: &str) -> String {
    reason
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_safe() {
        assert_eq!(header_safe("Host n1.example is occupied"), "Host n1.example is occupied");
        assert_eq!(header_safe("bad\nline\té"), "bad line  ");
        assert!(HeaderValue::from_str(&header_safe("x\r\ny")).is_ok());
    }
}
