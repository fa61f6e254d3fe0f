//! Dispatch tables built from the tunnel declarations

use http::Uri;
use nodegate_proto::{Protocol, TunnelDeclaration};
use std::collections::{BTreeMap, HashMap};

use crate::ClientError;

/// Forwarded host to local URL for HTTP tunnels
#[derive(Debug, Clone, Default)]
pub struct HttpRoutes {
    by_host: HashMap<String, Uri>,
    default: Option<Uri>,
}

impl HttpRoutes {
    pub fn insert(&mut self, host: &str, target: Uri) {
        self.by_host.insert(host.trim().to_ascii_lowercase(), target);
    }

    pub fn set_default(&mut self, target: Uri) {
        self.default = Some(target);
    }

    /// Resolve `host` trying `host:port`, then the port alone, then the bare
    /// host, then the default
    pub fn lookup(&self, host: &str) -> Option<&Uri> {
        let host = host.trim().to_ascii_lowercase();

        if let Some(target) = self.by_host.get(&host) {
            return Some(target);
        }

        if let Some((name, port)) = split_port(&host) {
            if let Some(target) = self.by_host.get(port) {
                return Some(target);
            }
            if let Some(target) = self.by_host.get(name) {
                return Some(target);
            }
        }

        self.default.as_ref()
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }
}

fn split_port(host: &str) -> Option<(&str, &str)> {
    let (name, port) = host.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // bare IPv6 without brackets has no port
    if name.contains(':') && !name.ends_with(']') {
        return None;
    }
    Some((name, port))
}

/// Build the HTTP and stream dispatch tables, validating local addresses
pub fn build_routes(
    tunnels: &BTreeMap<String, TunnelDeclaration>,
) -> Result<(HttpRoutes, HashMap<String, String>), ClientError> {
    let mut http = HttpRoutes::default();
    let mut streams = HashMap::new();

    for (name, tunnel) in tunnels {
        match tunnel.protocol {
            Protocol::Http => {
                let target = parse_local_url(name, &tunnel.local_address)?;
                if tunnel.host.trim().is_empty() {
                    return Err(ClientError::Config(format!(
                        "http tunnel {} needs a host",
                        name
                    )));
                }
                http.insert(&tunnel.host, target);
            }
            Protocol::Tcp | Protocol::Tcp4 | Protocol::Tcp6 | Protocol::Unix | Protocol::Sni => {
                if tunnel.local_address.trim().is_empty() {
                    return Err(ClientError::Config(format!(
                        "tunnel {} needs a local address",
                        name
                    )));
                }
                if tunnel.protocol == Protocol::Sni && tunnel.host.trim().is_empty() {
                    return Err(ClientError::Config(format!(
                        "sni tunnel {} needs a host",
                        name
                    )));
                }
                streams.insert(name.clone(), tunnel.local_address.trim().to_string());
            }
        }
    }

    let http_tunnels: Vec<&TunnelDeclaration> = tunnels
        .values()
        .filter(|t| t.protocol == Protocol::Http)
        .collect();
    if let [only] = http_tunnels.as_slice() {
        http.set_default(parse_local_url("default", &only.local_address)?);
    }

    Ok((http, streams))
}

fn parse_local_url(name: &str, url: &str) -> Result<Uri, ClientError> {
    let uri: Uri = url
        .trim()
        .parse()
        .map_err(|e| ClientError::Config(format!("tunnel {}: bad local url {:?}: {}", name, url, e)))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(ClientError::Config(format!(
                "tunnel {}: unsupported local scheme {}",
                name, other
            )))
        }
        None => {
            return Err(ClientError::Config(format!(
                "tunnel {}: local url {:?} needs an http:// scheme",
                name, url
            )))
        }
    }
    if uri.authority().is_none() {
        return Err(ClientError::Config(format!(
            "tunnel {}: local url {:?} has no host",
            name, url
        )));
    }

    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup_precedence() {
        let mut routes = HttpRoutes::default();
        routes.insert("n1.example:8080", uri("http://127.0.0.1:1"));
        routes.insert("8080", uri("http://127.0.0.1:2"));
        routes.insert("n1.example", uri("http://127.0.0.1:3"));
        routes.set_default(uri("http://127.0.0.1:4"));

        assert_eq!(routes.lookup("N1.example:8080"), Some(&uri("http://127.0.0.1:1")));
        assert_eq!(routes.lookup("other.example:8080"), Some(&uri("http://127.0.0.1:2")));
        assert_eq!(routes.lookup("n1.example:9090"), Some(&uri("http://127.0.0.1:3")));
        assert_eq!(routes.lookup("n1.example"), Some(&uri("http://127.0.0.1:3")));
        assert_eq!(routes.lookup("unknown"), Some(&uri("http://127.0.0.1:4")));
    }

    #[test]
    fn test_lookup_without_default() {
        let mut routes = HttpRoutes::default();
        routes.insert("n1.example", uri("http://127.0.0.1:3"));
        assert_eq!(routes.lookup("n2.example"), None);
    }

    #[test]
    fn test_build_routes() {
        let mut tunnels = BTreeMap::new();
        tunnels.insert(
            "rpc".to_string(),
            TunnelDeclaration::http("n1.example", "http://127.0.0.1:8545"),
        );
        tunnels.insert(
            "p2p".to_string(),
            TunnelDeclaration::tcp("127.0.0.1:30303", "0.0.0.0:AUTO"),
        );

        let (http, streams) = build_routes(&tunnels).unwrap();
        assert_eq!(http.len(), 1);
        // single HTTP tunnel doubles as the default
        assert_eq!(
            http.lookup("anything"),
            Some(&uri("http://127.0.0.1:8545"))
        );
        assert_eq!(streams["p2p"], "127.0.0.1:30303");
    }

    #[test]
    fn test_no_default_with_two_http_tunnels() {
        let mut tunnels = BTreeMap::new();
        tunnels.insert(
            "a".to_string(),
            TunnelDeclaration::http("a.example", "http://127.0.0.1:1"),
        );
        tunnels.insert(
            "b".to_string(),
            TunnelDeclaration::http("b.example", "http://127.0.0.1:2"),
        );

        let (http, _) = build_routes(&tunnels).unwrap();
        assert_eq!(http.lookup("c.example"), None);
    }

    #[test]
    fn test_bad_local_urls() {
        for bad in ["127.0.0.1:8545", "https://127.0.0.1:8545", "not a url", ""] {
            let mut tunnels = BTreeMap::new();
            tunnels.insert("rpc".to_string(), TunnelDeclaration::http("n1.example", bad));
            assert!(
                matches!(build_routes(&tunnels), Err(ClientError::Config(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_stream_tunnel_needs_local_address() {
        let mut tunnels = BTreeMap::new();
        tunnels.insert("p2p".to_string(), TunnelDeclaration::tcp("", "0.0.0.0:AUTO"));
        assert!(build_routes(&tunnels).is_err());
    }
}
