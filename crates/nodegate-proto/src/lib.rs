//! Tunnel Protocol Definitions
//!
//! Wire types shared by the tunnel server and the tunnel client:
//! tunnel declarations, the one-time handshake document and the control
//! message that labels every proxied exchange on a control connection.

pub mod control;
pub mod error;
pub mod handshake;
pub mod headers;
pub mod tunnel;

pub use control::{Action, ControlMessage};
pub use error::ProtoError;
pub use handshake::{Handshake, MAX_HANDSHAKE_BODY};
pub use tunnel::{BindAddr, Protocol, Tunnel, TunnelDeclaration};

/// Port sentinel asking the server to allocate a port from its address pool
pub const AUTO_PORT: &str = "AUTO";

/// Header carrying the client's bearer token on the handshake response
pub const HEADER_AUTH: &str = "x-auth-header";

/// Header carrying a handshake rejection reason from server to client
pub const HEADER_ERROR: &str = "x-error-header";
