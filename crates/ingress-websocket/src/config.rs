//! TLS configuration for dialing origin WebSocket services

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::WebSocketError;

/// TLS settings used when the origin is reached over `https`/`wss`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OriginTlsConfig {
    /// PEM file with additional trusted roots (webpki roots are used when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<PathBuf>,

    /// Disable origin certificate verification (INSECURE)
    #[serde(default)]
    pub no_tls_verify: bool,
}

impl OriginTlsConfig {
    /// Configuration trusting a custom root bundle
    pub fn with_ca_pool(path: impl Into<PathBuf>) -> Self {
        Self {
            ca_pool: Some(path.into()),
            no_tls_verify: false,
        }
    }

    /// Configuration for local development (skip cert verification)
    pub fn insecure() -> Self {
        Self {
            ca_pool: None,
            no_tls_verify: true,
        }
    }

    /// Build the rustls client configuration
    pub fn build_client_config(&self) -> Result<Arc<rustls::ClientConfig>, WebSocketError> {
        ensure_crypto_provider();

        if self.no_tls_verify {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth();
            return Ok(Arc::new(config));
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &self.ca_pool {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| {
                    WebSocketError::Tls(format!("Invalid root cert in {}: {}", path.display(), e))
                })?;
            }
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Arc::new(config))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, WebSocketError> {
    let file = File::open(path).map_err(|e| {
        WebSocketError::Tls(format!("Failed to open CA pool {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WebSocketError::Tls(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(WebSocketError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
