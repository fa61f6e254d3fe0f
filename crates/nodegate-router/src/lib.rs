//! Routing state for the tunnel server
//!
//! Owns who-holds-what: the public port pool for `AUTO` binds, the registry
//! of connected clients with its host index, and ClientHello SNI parsing for
//! TLS passthrough routing.

pub mod address_pool;
pub mod registry;
pub mod sni;

pub use address_pool::{AddressPool, PoolError, PortPool};
pub use registry::{
    normalize_host, HostAuth, HostRoute, ListenerEntry, Registry, RegistryError, RegistryItem,
};
pub use sni::{client_hello_len, extract_sni, SniError};
