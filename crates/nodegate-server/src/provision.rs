//! Tunnel provisioning and public TCP/Unix accept loops

use nodegate_proto::{BindAddr, ControlMessage, Protocol, Tunnel};
use nodegate_router::{HostAuth, ListenerEntry, RegistryError, RegistryItem};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::listener::{PublicListener, PublicStream};
use crate::server::Shared;
use crate::ServerError;

/// A listener opened for the current batch, not yet serving
struct Bound {
    entry: ListenerEntry,
    protocol: Protocol,
    listener: PublicListener,
}

impl Shared {
    /// Open every listener and claim every host of one handshake
    ///
    /// Either all tunnels go live or none do: on failure every listener
    /// opened for the batch is dropped and its pool port released.
    pub(crate) async fn provision(
        self: &Arc<Self>,
        client: &str,
        key: &str,
        tunnels: &BTreeMap<String, Tunnel>,
    ) -> Result<(), ServerError> {
        let mut item = RegistryItem::new(client, key);
        let mut bound: Vec<Bound> = Vec::new();

        let opened = self.open_batch(client, tunnels, &mut item, &mut bound).await;
        let committed = opened.and_then(|()| {
            item.listeners = bound.iter().map(|b| b.entry.clone()).collect();
            self.registry.set(item).map_err(ServerError::from)
        });

        if let Err(e) = committed {
            self.rollback(client, &bound);
            return Err(e);
        }

        for b in bound {
            info!(
                client,
                tunnel = %b.entry.name,
                protocol = %b.protocol,
                addr = %b.entry.addr,
                "Listening for tunnel"
            );
            let span = tracing::info_span!("tunnel", client, name = %b.entry.name);
            tokio::spawn(
                self.clone()
                    .accept_loop(key.to_string(), b.entry, b.protocol, b.listener)
                    .instrument(span),
            );
        }

        Ok(())
    }

    async fn open_batch(
        &self,
        client: &str,
        tunnels: &BTreeMap<String, Tunnel>,
        item: &mut RegistryItem,
        bound: &mut Vec<Bound>,
    ) -> Result<(), ServerError> {
        for (name, tunnel) in tunnels {
            match tunnel.protocol {
                Protocol::Http | Protocol::Sni => {
                    if tunnel.host.trim().is_empty() {
                        return Err(RegistryError::EmptyHost(name.clone()).into());
                    }
                    item.hosts.push(HostAuth {
                        host: tunnel.host.clone(),
                        tunnel: name.clone(),
                        protocol: tunnel.protocol,
                        auth: tunnel.auth.clone().filter(|a| !a.is_empty()),
                    });
                }
                Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 | Protocol::Unix => {
                    bound.push(self.bind_tunnel(client, name, tunnel).await?);
                }
            }
        }
        Ok(())
    }

    async fn bind_tunnel(
        &self,
        client: &str,
        name: &str,
        tunnel: &Tunnel,
    ) -> Result<Bound, ServerError> {
        if tunnel.protocol == Protocol::Unix {
            let listener = PublicListener::bind_unix(&tunnel.addr)?;
            return Ok(Bound {
                entry: ListenerEntry::new(name, listener.local_addr(), None),
                protocol: tunnel.protocol,
                listener,
            });
        }

        let (addr, pool_port) = match tunnel.bind_addr() {
            BindAddr::Auto { host } => {
                let port = self.pool.acquire(client, name)?;
                (BindAddr::Auto { host }.with_port(port), Some(port))
            }
            BindAddr::Fixed(addr) => (addr, None),
        };

        match PublicListener::bind_tcp(&addr, tunnel.protocol).await {
            Ok(listener) => Ok(Bound {
                entry: ListenerEntry::new(name, listener.local_addr(), pool_port),
                protocol: tunnel.protocol,
                listener,
            }),
            Err(e) => {
                if pool_port.is_some() {
                    let _ = self.pool.release_tunnel(client, name);
                }
                Err(e)
            }
        }
    }

    fn rollback(&self, client: &str, bound: &[Bound]) {
        for b in bound {
            if b.entry.pool_port.is_some() {
                let _ = self.pool.release_tunnel(client, &b.entry.name);
            }
        }
        debug!(client, listeners = bound.len(), "Rolled back tunnel batch");
    }

    async fn accept_loop(
        self: Arc<Self>,
        key: String,
        entry: ListenerEntry,
        protocol: Protocol,
        listener: PublicListener,
    ) {
        let cancel: CancellationToken = entry.token();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "Public connection accepted");
                        let msg = ControlMessage::proxy(protocol, entry.addr.as_str(), entry.name.as_str(), remote);
                        tokio::spawn(self.clone().proxy_stream(key.clone(), msg, stream));
                    }
                    Err(e) => {
                        warn!("Accept failed on {}: {}", entry.addr, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        debug!("Listener on {} closed", entry.addr);
    }

    /// Pipe one public connection through a fresh exchange to the client
    pub(crate) async fn proxy_stream(
        self: Arc<Self>,
        key: String,
        msg: ControlMessage,
        mut inbound: PublicStream,
    ) {
        let mut tunnel = match self.conns.open_stream(&key, &msg).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(tunnel = %msg.forwarded_id, "Failed to open exchange: {}", e);
                return;
            }
        };

        match copy_bidirectional(&mut inbound, &mut tunnel).await {
            Ok((up, down)) => debug!(
                tunnel = %msg.forwarded_id,
                remote = %msg.remote_addr,
                "Exchange finished ({} bytes up, {} bytes down)",
                up,
                down
            ),
            Err(e) => debug!(tunnel = %msg.forwarded_id, "Exchange aborted: {}", e),
        }
    }
}
