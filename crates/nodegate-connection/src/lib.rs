//! Multiplexed control connections
//!
//! Every client keeps one physical connection to the server. The server
//! drives it as an HTTP/2 client so it can push any number of independent
//! exchanges to the tunnel client, which answers as an HTTP/2 server. Each
//! exchange carries one proxied HTTP request or one public TCP connection.

pub mod body;
pub mod error;
pub mod pool;
pub mod stream;

pub use body::TunnelBody;
pub use error::ConnectionError;
pub use pool::{ConnPool, ConnPoolConfig, DisconnectFn};
pub use stream::{bridge, copy_body, splice_upgrades, STREAM_BUFFER};
