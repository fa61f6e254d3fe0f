//! HTTP header helpers shared by both proxy hops

use http::header::{self, HeaderMap, HeaderValue};

/// Connection-scoped headers that must not cross a proxy hop
///
/// `transfer-encoding` and `content-length` stay: hyper re-frames the body
/// from them on each side.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Protocol named in `Upgrade`, when `Connection` carries the `upgrade` token
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Strip connection-scoped headers before a message crosses a hop
///
/// An upgrade handshake survives as `Connection: upgrade` plus its
/// `Upgrade` header so WebSocket requests and their `101` answers pass.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let upgrade = upgrade_protocol(headers);

    // Headers named in `Connection` are hop-by-hop too
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
}

/// Append the caller's IP to `X-Forwarded-For`
pub fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, ip),
        _ => ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Extract the token of an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
