//! Control message carried in the headers of every proxied exchange

use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::fmt;

use crate::{ProtoError, Protocol};

pub const HEADER_ACTION: &str = "x-action";
pub const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";
pub const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const HEADER_FORWARDED_ID: &str = "x-forwarded-id";
pub const HEADER_REMOTE_ADDR: &str = "x-remote-addr";

/// What the client should do with an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Proxy,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Proxy => "proxy",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope identifying which tunnel a proxied exchange belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: Action,
    pub forwarded_protocol: Protocol,
    pub forwarded_host: String,
    /// Tunnel name on the client
    pub forwarded_id: String,
    /// Address of the original public caller
    pub remote_addr: String,
}

impl ControlMessage {
    pub fn proxy(
        protocol: Protocol,
        forwarded_host: impl Into<String>,
        forwarded_id: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            action: Action::Proxy,
            forwarded_protocol: protocol,
            forwarded_host: forwarded_host.into(),
            forwarded_id: forwarded_id.into(),
            remote_addr: remote_addr.into(),
        }
    }

    pub fn write_to_headers(&self, headers: &mut HeaderMap) -> Result<(), ProtoError> {
        headers.insert(
            HeaderName::from_static(HEADER_ACTION),
            HeaderValue::from_static(self.action.as_str()),
        );
        headers.insert(
            HeaderName::from_static(HEADER_FORWARDED_PROTO),
            HeaderValue::from_static(self.forwarded_protocol.as_str()),
        );
        insert_str(headers, HEADER_FORWARDED_HOST, &self.forwarded_host)?;
        insert_str(headers, HEADER_FORWARDED_ID, &self.forwarded_id)?;
        insert_str(headers, HEADER_REMOTE_ADDR, &self.remote_addr)?;
        Ok(())
    }

    pub fn read_from_headers(headers: &HeaderMap) -> Result<Self, ProtoError> {
        let action = match required(headers, HEADER_ACTION)? {
            "proxy" => Action::Proxy,
            other => return Err(ProtoError::UnknownAction(other.to_string())),
        };
        let forwarded_protocol = required(headers, HEADER_FORWARDED_PROTO)?.parse()?;

        Ok(Self {
            action,
            forwarded_protocol,
            forwarded_host: optional(headers, HEADER_FORWARDED_HOST)?,
            forwarded_id: optional(headers, HEADER_FORWARDED_ID)?,
            remote_addr: optional(headers, HEADER_REMOTE_ADDR)?,
        })
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), ProtoError> {
    let value = HeaderValue::from_str(value).map_err(|_| ProtoError::InvalidHeader(name))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ProtoError> {
    headers
        .get(name)
        .ok_or(ProtoError::MissingHeader(name))?
        .to_str()
        .map_err(|_| ProtoError::InvalidHeader(name))
}

fn optional(headers: &HeaderMap, name: &'static str) -> Result<String, ProtoError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(str::to_string)
            .map_err(|_| ProtoError::InvalidHeader(name)),
        None => Ok(String::new()),
    }
}
