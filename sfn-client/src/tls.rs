//! TLS and QUIC configuration for outbound connections.

use crate::error::ClientError;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Keep-alive sent on otherwise idle connections.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// TLS settings for a client connection.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Additional certificates trusted as roots (e.g. a dev server's own cert).
    pub trusted_certs: Vec<CertificateDer<'static>>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI and verification (defaults to the address host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_trusted_cert(mut self, cert: CertificateDer<'static>) -> Self {
        self.trusted_certs.push(cert);
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Builds the QUIC client configuration.
pub fn create_client_config(
    config: &TlsClientConfig,
    idle_timeout: Duration,
) -> Result<quinn::ClientConfig, ClientError> {
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ClientError::TlsConfig(format!("unsupported protocol versions: {}", e)))?;

    let mut tls = if config.insecure {
        tracing::warn!("Using insecure TLS (certificate verification disabled)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(config)?)
            .with_no_client_auth()
    };
    tls.alpn_protocols = vec![sfn_protocol::ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| ClientError::TlsConfig(format!("no QUIC cipher suite: {}", e)))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle_timeout.try_into().map_err(|_| {
        ClientError::TlsConfig(format!("idle timeout {:?} out of range", idle_timeout))
    })?));
    if idle_timeout > KEEP_ALIVE_INTERVAL {
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    }
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

fn root_store(config: &TlsClientConfig) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    if let Some(ref ca_path) = config.ca_cert_path {
        for cert in load_certs(ca_path)? {
            store
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
        }
    } else if config.trusted_certs.is_empty() {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    for cert in &config.trusted_certs {
        store
            .add(cert.clone())
            .map_err(|e| ClientError::TlsConfig(format!("invalid trusted cert: {}", e)))?;
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &rustls::pki_types::ServerName<'_>,
        _: &[u8],
        _: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_uses_webpki_roots() {
        let store = root_store(&TlsClientConfig::new()).unwrap();
        assert!(!store.is_empty());
        assert!(create_client_config(&TlsClientConfig::new(), Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_trusted_cert_only() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let config = TlsClientConfig::new().with_trusted_cert(certified.cert.der().clone());
        assert_eq!(root_store(&config).unwrap().len(), 1);
    }

    #[test]
    fn test_ca_file() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(certified.cert.pem().as_bytes()).unwrap();

        let config = TlsClientConfig::new().with_ca_cert(file.path());
        assert_eq!(root_store(&config).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsClientConfig::new().with_ca_cert("/nonexistent/ca.pem");
        let err = create_client_config(&config, Duration::from_secs(30)).unwrap_err();
        assert!(err.to_string().contains("cannot open"));
    }

    #[test]
    fn test_insecure() {
        let config = TlsClientConfig::new().with_insecure();
        assert!(create_client_config(&config, Duration::from_secs(30)).is_ok());
    }
}
