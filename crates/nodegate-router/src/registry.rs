//! Client registry and public host index
//!
//! Tracks every control connection from the moment it is accepted until it
//! drops:
//!
//! ```text
//! pre_subscribe(key)     -> pending
//! subscribe(name, key)   -> subscribed, no tunnels
//! set(item)              -> active, hosts routable
//! clear(key)/unsubscribe -> removed
//! ```
//!
//! One mutex covers the whole state so a batch of host claims is committed
//! or rejected as a unit.

use nodegate_proto::Protocol;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection {0} already pre-subscribed")]
    AlreadyPending(String),

    #[error("Connection {0} was never pre-subscribed")]
    NotPending(String),

    #[error("Client {0} already subscribed")]
    AlreadySubscribed(String),

    #[error("Client {0} not subscribed")]
    NotSubscribed(String),

    #[error("Client {0} already has tunnels")]
    AlreadyActive(String),

    #[error("Host {0} is occupied")]
    Occupied(String),

    #[error("Empty host for tunnel {0}")]
    EmptyHost(String),
}

/// One host claimed by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAuth {
    pub host: String,
    pub tunnel: String,
    pub protocol: Protocol,
    /// Bearer secret callers must present
    pub auth: Option<String>,
}

/// A socket bound on behalf of a client
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub name: String,
    pub addr: String,
    /// Pool port backing this listener, if it was an `AUTO` bind
    pub pool_port: Option<u16>,
    cancel: CancellationToken,
}

impl ListenerEntry {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, pool_port: Option<u16>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            pool_port,
            cancel: CancellationToken::new(),
        }
    }

    /// Token the accept loop watches
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Everything one connected client owns
#[derive(Debug, Clone)]
pub struct RegistryItem {
    pub client_name: String,
    /// Connection key, also the connection pool key
    pub client_id: String,
    pub hosts: Vec<HostAuth>,
    pub listeners: Vec<ListenerEntry>,
}

impl RegistryItem {
    pub fn new(client_name: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            client_id: client_id.into(),
            hosts: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Cancel every accept loop owned by this item
    pub fn close_listeners(&self) {
        for listener in &self.listeners {
            listener.close();
        }
    }
}

/// Routing answer for a public host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRoute {
    pub client_name: String,
    pub client_id: String,
    pub tunnel: String,
    pub protocol: Protocol,
    pub auth: Option<String>,
}

#[derive(Debug)]
struct Slot {
    client_id: String,
    item: Option<RegistryItem>,
}

#[derive(Debug, Default)]
struct State {
    pending: HashSet<String>,
    clients: HashMap<String, Slot>,
    by_conn: HashMap<String, String>,
    hosts: HashMap<String, HostRoute>,
}

impl State {
    fn remove_client(&mut self, name: &str) -> Option<RegistryItem> {
        let slot = self.clients.remove(name)?;
        self.by_conn.remove(&slot.client_id);

        let item = slot.item?;
        for claim in &item.hosts {
            self.hosts.remove(&normalize_host(&claim.host));
        }
        Some(item)
    }
}

/// Registry of connected clients
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a placeholder for a freshly accepted connection
    pub fn pre_subscribe(&self, key: &str) -> Result<(), RegistryError> {
        let mut state = self.state();

        if state.pending.contains(key) || state.by_conn.contains_key(key) {
            warn!(key, "Connection already pre-subscribed");
            return Err(RegistryError::AlreadyPending(key.to_string()));
        }

        state.pending.insert(key.to_string());
        trace!(key, "Pre-subscribed connection");
        Ok(())
    }

    /// Promote a placeholder to a named client
    pub fn subscribe(&self, name: &str, key: &str) -> Result<(), RegistryError> {
        let mut state = self.state();

        if state.clients.contains_key(name) {
            warn!(name, key, "Client already subscribed");
            return Err(RegistryError::AlreadySubscribed(name.to_string()));
        }
        if !state.pending.remove(key) {
            warn!(name, key, "Subscribe without pre-subscribe");
            return Err(RegistryError::NotPending(key.to_string()));
        }

        state.clients.insert(
            name.to_string(),
            Slot {
                client_id: key.to_string(),
                item: None,
            },
        );
        state.by_conn.insert(key.to_string(), name.to_string());
        debug!(name, key, "Client subscribed");
        Ok(())
    }

    /// Commit a client's tunnels
    ///
    /// Every host in `item` is checked before anything changes. On error the
    /// registry is untouched and the caller still owns the listeners it
    /// opened for the batch.
    pub fn set(&self, item: RegistryItem) -> Result<(), RegistryError> {
        let mut state = self.state();
        let name = item.client_name.clone();

        match state.clients.get(&name) {
            Some(slot) if slot.client_id != item.client_id => {
                return Err(RegistryError::NotSubscribed(name));
            }
            Some(slot) if slot.item.is_some() => {
                return Err(RegistryError::AlreadyActive(name));
            }
            Some(_) => {}
            None => return Err(RegistryError::NotSubscribed(name)),
        }

        let mut claimed = HashSet::new();
        for claim in &item.hosts {
            let host = normalize_host(&claim.host);
            if host.is_empty() {
                return Err(RegistryError::EmptyHost(claim.tunnel.clone()));
            }
            if state.hosts.contains_key(&host) || !claimed.insert(host.clone()) {
                warn!(client = %name, host = %host, "Host already claimed");
                return Err(RegistryError::Occupied(host));
            }
        }

        for claim in &item.hosts {
            state.hosts.insert(
                normalize_host(&claim.host),
                HostRoute {
                    client_name: item.client_name.clone(),
                    client_id: item.client_id.clone(),
                    tunnel: claim.tunnel.clone(),
                    protocol: claim.protocol,
                    auth: claim.auth.clone(),
                },
            );
        }

        debug!(
            client = %name,
            hosts = item.hosts.len(),
            listeners = item.listeners.len(),
            "Committed tunnels"
        );

        if let Some(slot) = state.clients.get_mut(&name) {
            slot.item = Some(item);
        }
        Ok(())
    }

    /// Resolve a public host, with or without a `:port` suffix
    pub fn subscriber(&self, host: &str) -> Option<HostRoute> {
        self.state().hosts.get(&normalize_host(host)).cloned()
    }

    /// Remove `name` if it still owns connection `key`
    pub fn unsubscribe(&self, key: &str, name: &str) -> Option<RegistryItem> {
        let mut state = self.state();

        if state.by_conn.get(key).map(String::as_str) != Some(name) {
            trace!(key, name, "Unsubscribe of unknown client");
            return None;
        }

        let item = state.remove_client(name);
        debug!(key, name, "Client unsubscribed");
        item
    }

    /// Drop whatever connection `key` registered; safe to call repeatedly
    pub fn clear(&self, key: &str) -> Option<RegistryItem> {
        let mut state = self.state();

        if state.pending.remove(key) {
            trace!(key, "Cleared pending connection");
            return None;
        }

        let name = state.by_conn.get(key)?.clone();
        let item = state.remove_client(&name);
        debug!(key, name = %name, "Cleared client");
        item
    }

    /// Whether `name` has subscribed and not yet been removed
    pub fn is_subscribed(&self, name: &str) -> bool {
        self.state().clients.contains_key(name)
    }

    /// Names of subscribed clients, sorted
    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().clients.keys().cloned().collect();
        names.sort();
        names
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lowercase a host and strip any port, keeping IPv6 brackets
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let bare = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port))
                if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    };

    bare.trim_end_matches('.').to_ascii_lowercase()
}
