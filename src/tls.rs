//! TLS plumbing: the client-mode session factory used for TLS-tunneled
//! remotes, and server config loading for the TLS listener.

use crate::error::ProxyError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Builds client-mode TLS sessions keyed by target host and port. The root
/// store is loaded once from the platform trust store.
pub struct SessionFactory {
    connector: TlsConnector,
}

impl SessionFactory {
    pub fn new() -> Result<Self, ProxyError> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            // Plain dispatch still works; TLS-tunneled remotes will fail
            // their handshakes until a trust store is installed.
            log::warn!("no trusted root certificates available on this system");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Wraps an established TCP connection in a client-mode TLS session for
    /// the given remote. A failure here is fatal for the remote attempt
    /// only, never for the client-facing connection.
    pub async fn create_client_session(
        &self,
        host: &str,
        port: u16,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ProxyError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid TLS server name: {}", host)))?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("handshake with {}:{} failed: {}", host, port, e)))
    }
}

/// TLS listener configuration from PEM certificate and private key files.
pub fn create_server_config(
    private_key_path: &str,
    cert_path: &str,
) -> Result<ServerConfig, ProxyError> {
    let mut private_key_file = BufReader::new(File::open(private_key_path).map_err(|e| {
        ProxyError::Config(format!("Failed to open private key file: {}", e))
    })?);

    let mut cert_file = BufReader::new(
        File::open(cert_path)
            .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Config("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut private_key_file)
        .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))?;

    Ok(config)
}
