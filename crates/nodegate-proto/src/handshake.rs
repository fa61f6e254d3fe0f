//! Handshake document exchanged once per control connection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ProtoError, Tunnel};

/// Upper bound on the handshake body the server is willing to read
pub const MAX_HANDSHAKE_BODY: u64 = 126_976;

/// Body of the client's reply to the server's hello request
///
/// ```json
/// {"IdName": "node-1", "Tunnels": {"rpc": {"Protocol": "http", "Host": "n1.example", "Addr": ""}}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Handshake {
    pub id_name: String,
    pub tunnels: BTreeMap<String, Tunnel>,
}

impl Handshake {
    pub fn new(id_name: impl Into<String>, tunnels: BTreeMap<String, Tunnel>) -> Self {
        Self {
            id_name: id_name.into(),
            tunnels,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() as u64 > MAX_HANDSHAKE_BODY {
            return Err(ProtoError::BodyTooLarge {
                limit: MAX_HANDSHAKE_BODY,
            });
        }
        Ok(bytes)
    }

    /// Decode and validate a handshake body
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() as u64 > MAX_HANDSHAKE_BODY {
            return Err(ProtoError::BodyTooLarge {
                limit: MAX_HANDSHAKE_BODY,
            });
        }

        let handshake: Handshake = serde_json::from_slice(bytes)?;

        if handshake.id_name.trim().is_empty() {
            return Err(ProtoError::MissingIdName);
        }
        if handshake.tunnels.is_empty() {
            return Err(ProtoError::NoTunnels);
        }

        Ok(handshake)
    }
}
