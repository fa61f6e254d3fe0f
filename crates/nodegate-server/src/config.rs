//! Server configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ServerError;

/// Decides whether a client's bearer token is acceptable
pub type AuthHandler = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Default time the server waits for a client's hello response
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Construction-time parameters of a [`crate::Server`]
#[derive(Clone)]
pub struct ServerConfig {
    /// Control listener address, e.g. `0.0.0.0:4443`
    pub listen_addr: String,
    /// Pool for `AUTO` ports, `"first:last"` with `last` exclusive
    pub port_range: String,
    pub auth: Option<AuthHandler>,
    /// TLS for the control listener; plaintext when `None`
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
    pub keep_alive_timeout: Duration,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, port_range: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            port_range: port_range.into(),
            auth: None,
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keep_alive_interval: Some(Duration::from_secs(30)),
            keep_alive_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_auth<F>(mut self, auth: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn with_auth_handler(mut self, auth: AuthHandler) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Accept exactly one shared token
    pub fn with_token(self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.with_auth(move |presented| presented == token)
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, interval: Option<Duration>, timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ServerError::Config("listen address is required".to_string()));
        }
        if self.auth.is_none() {
            return Err(ServerError::Config("auth handler is required".to_string()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ServerError::Config(
                "handshake timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("port_range", &self.port_range)
            .field("auth", &self.auth.is_some())
            .field("tls", &self.tls.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ServerConfig::new("127.0.0.1:0", "7000:7100")
            .with_token("t")
            .validate()
            .is_ok());

        assert!(matches!(
            ServerConfig::new("", "7000:7100").with_token("t").validate(),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::new("127.0.0.1:0", "7000:7100").validate(),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_with_token() {
        let config = ServerConfig::new("127.0.0.1:0", "7000:7100").with_token("s3cret");
        let auth = config.auth.unwrap();
        assert!(auth("s3cret"));
        assert!(!auth("guess"));
        assert!(!auth(""));
    }
}
