//! Certificate loading for HTTPS frontends

use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Build the server TLS configuration from a PEM certificate chain and a PEM
/// private key (PKCS#8, PKCS#1 or SEC1)
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let mut cert_file = BufReader::new(File::open(cert_path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open certificate file {}: {}", cert_path.display(), e))
    })?);
    let mut key_file = BufReader::new(File::open(key_path).map_err(|e| {
        ProxyError::Tls(format!("Failed to open private key file {}: {}", key_path.display(), e))
    })?);

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No valid certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_file)
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls(format!("No valid private key found in {}", key_path.display())))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create TLS config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(cert = %cert_path.display(), "Loaded TLS certificate");
    Ok(Arc::new(config))
}

/// Acceptor performing the server side of the handshake for each connection
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    load_server_config(cert_path, key_path).map(TlsAcceptor::from)
}
