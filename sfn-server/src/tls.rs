//! TLS and QUIC endpoint configuration.

use crate::config::TlsConfig;
use crate::error::ServerError;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Subject name of the in-process dev certificate.
pub const DEV_SERVER_NAME: &str = "localhost";

/// Builds the QUIC server configuration from TLS settings.
///
/// In dev mode a self-signed certificate for `localhost` is generated;
/// otherwise the certificate chain and key are read from PEM files.
pub fn create_server_config(
    config: &TlsConfig,
    idle_timeout: Duration,
) -> Result<quinn::ServerConfig, ServerError> {
    let (certs, key) = if config.dev_mode {
        generate_dev_cert()?
    } else {
        let cert_path = config
            .cert_path
            .as_ref()
            .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
        let key_path = config
            .key_path
            .as_ref()
            .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;
        (load_certs(cert_path)?, load_private_key(key_path)?)
    };

    build_server_config(certs, key, idle_timeout)
}

/// QUIC server configuration for a given certificate chain and key.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    idle_timeout: Duration,
) -> Result<quinn::ServerConfig, ServerError> {
    let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ServerError::TlsConfig(format!("unsupported protocol versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;
    tls.alpn_protocols = vec![sfn_protocol::ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| ServerError::TlsConfig(format!("no QUIC cipher suite: {}", e)))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle_timeout.try_into().map_err(|_| {
        ServerError::TlsConfig(format!("idle timeout {:?} out of range", idle_timeout))
    })?));
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

/// Generates a self-signed certificate for [`DEV_SERVER_NAME`].
pub fn generate_dev_cert(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let certified = rcgen::generate_simple_self_signed(vec![DEV_SERVER_NAME.to_string()])
        .map_err(|e| ServerError::TlsConfig(format!("cannot generate dev certificate: {}", e)))?;
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((vec![certified.cert.der().clone()], key.into()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ServerError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}
