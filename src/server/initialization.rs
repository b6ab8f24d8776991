// src/server/initialization.rs

//! Handles server initialization: TLS material, the listening socket, and the
//! shared context.

use super::context::ServerContext;
use super::registry::SessionRegistry;
use crate::config::Config;
use crate::connection::ExactVersion;
use crate::core::rpc::RemoteRegistry;
use anyhow::{Context, Result, anyhow};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::{TlsAcceptor, rustls};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Initializes all server components before the accept loop starts.
pub async fn setup(config: Config, remote: Arc<RemoteRegistry>) -> Result<ServerContext> {
    log_startup_info(&config);

    let acceptor = setup_tls(&config)?;

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let local_addr = listener.local_addr()?;
    info!("Questlink server listening on {local_addr}");

    Ok(ServerContext {
        config,
        registry: SessionRegistry::new(),
        listeners: RwLock::new(Vec::new()),
        version_policy: RwLock::new(Arc::new(ExactVersion)),
        banned: RwLock::new(HashSet::new()),
        remote,
        local_addr,
        listener: Mutex::new(Some(listener)),
        acceptor,
        shutdown: CancellationToken::new(),
        tasks: Mutex::new(Vec::new()),
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
pub(crate) fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Server version '{}', codec {:?}, keep-alive {:?}.",
        config.version, config.codec, config.keep_alive
    );
    info!(
        "Accepting up to {} sessions; retained sessions kept for {:?}.",
        config.max_connections, config.reconnect_window
    );
    match &config.password {
        Some(_) => info!("Clients must present the server password."),
        None => warn!("No password configured. Any client with a matching version may connect."),
    }
    if !config.require_resume_token {
        warn!("Resume tokens are not required. A reconnect is matched by name alone.");
    }
}
