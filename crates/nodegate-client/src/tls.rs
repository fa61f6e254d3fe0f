//! TLS material for the control connection

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Once};

use crate::{ClientError, TlsMaterial};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

/// Install ring as the process-wide rustls provider if none is set
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

impl TlsMaterial {
    /// Verify the server against `roots`
    pub fn with_roots(roots: RootCertStore, server_name: impl Into<String>) -> Self {
        ensure_crypto_provider();

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        TlsMaterial::Rustls {
            config: Arc::new(config),
            server_name: server_name.into(),
        }
    }

    /// Verify the server against the bundled web PKI roots
    pub fn webpki(server_name: impl Into<String>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots, server_name)
    }

    /// Verify the server against the certificates in a PEM bundle
    pub fn from_ca_pem(pem: &[u8], server_name: impl Into<String>) -> Result<Self, ClientError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(pem))
                .collect::<Result<_, _>>()
                .map_err(|e| ClientError::Tls(format!("Invalid CA PEM: {}", e)))?;

        if certs.is_empty() {
            return Err(ClientError::Tls("CA PEM holds no certificates".to_string()));
        }

        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("Invalid root cert: {}", e)))?;
        }

        Ok(Self::with_roots(roots, server_name))
    }

    pub fn from_ca_file(
        path: impl AsRef<Path>,
        server_name: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let pem = std::fs::read(path.as_ref())?;
        Self::from_ca_pem(&pem, server_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ca_pem() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let pem = cert.serialize_pem().unwrap();

        let material = TlsMaterial::from_ca_pem(pem.as_bytes(), "localhost").unwrap();
        assert!(matches!(
            material,
            TlsMaterial::Rustls { ref server_name, .. } if server_name == "localhost"
        ));
    }

    #[test]
    fn test_empty_pem_rejected() {
        assert!(matches!(
            TlsMaterial::from_ca_pem(b"", "localhost"),
            Err(ClientError::Tls(_))
        ));
    }
}
