//! File-based configuration for the `nodegate` binary

use anyhow::{bail, Context, Result};
use nodegate_client::ExponentialBackoff;
use nodegate_proto::TunnelDeclaration;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Tunnels file passed to `nodegate client --tunnels`
///
/// ```yaml
/// tunnels:
///   rpc:
///     protocol: http
///     host: n1.example
///     local_address: http://127.0.0.1:8545
///   p2p:
///     protocol: tcp
///     local_address: 127.0.0.1:30303
///     remote_address: 0.0.0.0:AUTO
/// backoff:
///   initial_interval_ms: 500
///   max_elapsed_secs: 900
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelsFile {
    pub tunnels: BTreeMap<String, TunnelDeclaration>,
    #[serde(default)]
    pub backoff: BackoffSettings,
}

/// Reconnect policy overrides; unset fields keep the defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffSettings {
    pub initial_interval_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub max_interval_secs: Option<u64>,
    /// `0` retries forever
    pub max_elapsed_secs: Option<u64>,
}

impl BackoffSettings {
    pub fn to_backoff(&self) -> ExponentialBackoff {
        let defaults = ExponentialBackoff::default();
        ExponentialBackoff::new(
            self.initial_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_interval),
            self.multiplier.unwrap_or(defaults.multiplier),
            self.max_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_interval),
            match self.max_elapsed_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.max_elapsed,
            },
        )
    }
}

impl TunnelsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tunnels file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid tunnels file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: TunnelsFile = serde_yaml::from_str(text)?;
        if file.tunnels.is_empty() {
            bail!("no tunnels declared");
        }
        Ok(file)
    }
}

/// Build a rustls server config from PEM certificate chain and key files
pub fn load_server_tls(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    nodegate_client::ensure_crypto_provider();

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("Failed to open certificate {}", cert_path.display()))?,
    ))
    .collect::<Result<_, _>>()
    .context("Failed to parse certificate PEM")?;
    if certs.is_empty() {
        bail!("No certificates found in {}", cert_path.display());
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path)
            .with_context(|| format!("Failed to open private key {}", key_path.display()))?,
    ))
    .context("Failed to parse private key PEM")?
    .with_context(|| format!("No private key found in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate and key do not match")?;

    Ok(Arc::new(config))
}
