//! Tunnel server lifecycle

use nodegate_connection::{ConnPool, ConnPoolConfig, DisconnectFn};
use nodegate_router::{AddressPool, PortPool, Registry, RegistryItem};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{ServerConfig, ServerError};

/// State shared by every task the server spawns
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Registry,
    pub(crate) pool: Arc<AddressPool>,
    pub(crate) conns: ConnPool,
    pub(crate) shutdown: CancellationToken,
    tls: Option<TlsAcceptor>,
}

/// Reverse tunnel server
///
/// Accepts control connections from tunnel clients, provisions their
/// tunnels and routes public traffic to them.
pub struct Server {
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate `config`, parse the port range and bind the control listener
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let pool = Arc::new(AddressPool::parse(&config.port_range)?);
        let listener =
            TcpListener::bind(config.listen_addr.as_str())
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.listen_addr.clone(),
                    source,
                })?;
        let local_addr = listener.local_addr()?;

        let tls = config.tls.clone().map(TlsAcceptor::from);
        let conn_config = ConnPoolConfig {
            keep_alive_interval: config.keep_alive_interval,
            keep_alive_timeout: config.keep_alive_timeout,
        };

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let on_disconnect: DisconnectFn = Arc::new(move |key: &str| {
                if let Some(shared) = weak.upgrade() {
                    shared.disconnected(key);
                }
            });

            Shared {
                config,
                registry: Registry::new(),
                pool,
                conns: ConnPool::new(conn_config, on_disconnect),
                shutdown: CancellationToken::new(),
                tls,
            }
        });

        info!(
            "Tunnel server listening on {} (tls: {})",
            local_addr,
            shared.tls.is_some()
        );

        Ok(Self {
            shared,
            listener: Mutex::new(Some(listener)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept control connections until [`Server::stop`] is called
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;

        let shutdown = self.shared.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Tunnel server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        let span = tracing::info_span!(
                            "control",
                            remote = %peer,
                            client = tracing::field::Empty
                        );
                        tokio::spawn(shared.handle_conn(stream, peer).instrument(span));
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    /// Stop accepting and drop every client; their tunnels are torn down
    pub fn stop(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping tunnel server");
        self.shared.shutdown.cancel();
        self.shared.conns.close_all();
    }

    /// Drop client `name` if it still owns control connection `key`
    ///
    /// Its listeners close, its pool ports are freed and the control
    /// connection is closed. Returns `false` when `key` does not belong to
    /// `name` any more.
    pub fn unsubscribe(&self, key: &str, name: &str) -> bool {
        let Some(item) = self.shared.registry.unsubscribe(key, name) else {
            return false;
        };
        self.shared.teardown(&item);
        self.shared.conns.delete_conn(key);
        true
    }

    /// Port allocation capability for node registration
    pub fn port_pool(&self) -> Arc<dyn PortPool> {
        self.shared.pool.clone()
    }

    pub fn address_pool(&self) -> &AddressPool {
        &self.shared.pool
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Number of live control connections
    pub fn connection_count(&self) -> usize {
        self.shared.conns.len()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let key = peer.to_string();
        let _ = stream.set_nodelay(true);

        if self.registry.pre_subscribe(&key).is_err() {
            return;
        }

        let added = match &self.tls {
            Some(acceptor) => {
                match timeout(self.config.handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => self.conns.add_conn(tls, &key).await,
                    Ok(Err(e)) => {
                        warn!("TLS handshake failed: {}", e);
                        self.registry.clear(&key);
                        return;
                    }
                    Err(_) => {
                        warn!("TLS handshake timed out");
                        self.registry.clear(&key);
                        return;
                    }
                }
            }
            None => self.conns.add_conn(stream, &key).await,
        };

        if let Err(e) = added {
            warn!("Failed to open control channel: {}", e);
            self.registry.clear(&key);
            return;
        }
        debug!("Control channel open");

        match self.handshake(&key).await {
            Ok(name) => info!(client = %name, "Client connected"),
            Err(e) => {
                warn!("Rejecting client: {}", e);
                self.reject(&key, &e).await;
                self.conns.delete_conn(&key);
            }
        }
    }

    /// Tear down whatever connection `key` owned; runs once per channel
    pub(crate) fn disconnected(&self, key: &str) {
        match self.registry.clear(key) {
            Some(item) => self.teardown(&item),
            None => debug!(key, "Nothing registered for connection"),
        }
    }

    /// Close the listeners of a removed item and free its pool ports
    fn teardown(&self, item: &RegistryItem) {
        for listener in &item.listeners {
            listener.close();
            if listener.pool_port.is_some() {
                if let Err(e) = self.pool.release_tunnel(&item.client_name, &listener.name) {
                    warn!(client = %item.client_name, "Pool release failed: {}", e);
                }
            }
        }

        info!(
            client = %item.client_name,
            hosts = item.hosts.len(),
            listeners = item.listeners.len(),
            "Tunnels torn down"
        );
    }
}
