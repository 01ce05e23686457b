//! TLS configuration helpers for dialed and accepted connections.
//!
//! Clients verify the server against a PEM bundle of root certificates.
//! The acceptor side exists mainly so servers and tests can terminate the
//! same handshake.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, RpcError};

pub use tokio_rustls::client::TlsStream as ClientTlsStream;
pub use tokio_rustls::server::TlsStream as ServerTlsStream;

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    for item in rustls_pemfile::certs(&mut cursor) {
        let cert = item.map_err(|e| RpcError::Tls {
            reason: format!("malformed certificate PEM: {}", e),
        })?;
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(RpcError::Tls {
            reason: "unable to load root certificates".to_string(),
        });
    }

    Ok(certs)
}

/// Loads the first private key (PKCS#8, PKCS#1 or SEC1) from PEM data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(RpcError::Tls {
            reason: "no private key found in PEM".to_string(),
        }),
        Err(e) => Err(RpcError::Tls {
            reason: format!("malformed private key PEM: {}", e),
        }),
    }
}

/// A client config trusting only the roots in `root_pem`.
pub fn client_config_from_roots(root_pem: &[u8]) -> Result<Arc<rustls::ClientConfig>> {
    install_provider();
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_pem(root_pem)? {
        roots.add(cert).map_err(|e| RpcError::Tls {
            reason: format!("failed to add root certificate: {}", e),
        })?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A server config presenting `cert_chain_pem` without client auth.
pub fn server_config(cert_chain_pem: &[u8], key_pem: &[u8]) -> Result<Arc<rustls::ServerConfig>> {
    install_provider();
    let certs = load_certs_from_pem(cert_chain_pem)?;
    let key = load_private_key_from_pem(key_pem)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RpcError::Tls {
            reason: format!("failed to create server config: {}", e),
        })?;
    Ok(Arc::new(config))
}

/// Converts a host string (name or IP literal) to a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| RpcError::Tls {
        reason: format!("invalid server name {}: {}", host, e),
    })
}

/// Runs the client handshake over `stream`.
pub async fn connect<IO>(
    config: Arc<rustls::ClientConfig>,
    host: &str,
    stream: IO,
) -> Result<ClientTlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let name = server_name(host)?;
    tokio_rustls::TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| RpcError::Tls {
            reason: format!("TLS handshake failed: {}", e),
        })
}

/// Runs the server handshake over `stream`.
pub async fn accept<IO>(config: Arc<rustls::ServerConfig>, stream: IO) -> Result<ServerTlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    tokio_rustls::TlsAcceptor::from(config)
        .accept(stream)
        .await
        .map_err(|e| RpcError::Tls {
            reason: format!("TLS accept failed: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_certs_rejects_empty() {
        let err = load_certs_from_pem(b"").unwrap_err();
        assert!(err.to_string().contains("root certificates"));
    }

    #[test]
    fn test_load_private_key_rejects_garbage() {
        assert!(load_private_key_from_pem(b"not a key").is_err());
    }

    #[test]
    fn test_server_name_forms() {
        assert!(matches!(
            server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(server_name("[::1]").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(
            server_name("example.com").unwrap(),
            ServerName::DnsName(_)
        ));
        assert!(server_name("bad name!").is_err());
    }
}
