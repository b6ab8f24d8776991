// src/client/tls.rs

use crate::config::{ClientConfig, ClientTlsConfig};
use crate::core::SessionError;
use crate::server::{AnyStream, load_certs};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, rustls};
use tracing::info;

/// Wraps `tcp` in TLS when the client is configured for it.
pub(crate) async fn wrap(config: &ClientConfig, tcp: TcpStream) -> Result<AnyStream, SessionError> {
    if !config.tls.enabled {
        return Ok(AnyStream::Tcp(tcp));
    }

    let domain = config
        .tls
        .domain
        .clone()
        .unwrap_or_else(|| config.host.clone());
    info!("Establishing TLS connection with {domain}");
    let connector = connector(&config.tls)?;
    let server_name = rustls::pki_types::ServerName::try_from(domain.clone())
        .map_err(|_| SessionError::Tls(format!("Invalid TLS domain name '{domain}'")))?;

    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| SessionError::Tls(format!("TLS handshake failed: {e}")))?;
    Ok(AnyStream::ClientTls(Box::new(tls_stream)))
}

fn connector(tls: &ClientTlsConfig) -> Result<TlsConnector, SessionError> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    match &tls.ca_path {
        Some(path) => {
            let certs = load_certs(path).map_err(|e| SessionError::Tls(e.to_string()))?;
            for cert in certs {
                root_cert_store
                    .add(cert)
                    .map_err(|e| SessionError::Tls(format!("Bad CA certificate in '{path}': {e}")))?;
            }
        }
        None => root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}
