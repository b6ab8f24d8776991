// src/server/context.rs

use super::listener::ServerListener;
use super::registry::SessionRegistry;
use crate::config::Config;
use crate::connection::VersionPolicy;
use crate::core::rpc::RemoteRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Holds all the state shared between the server handle, the accept loop,
/// handshake tasks and the sessions themselves.
pub struct ServerContext {
    pub config: Config,
    pub registry: SessionRegistry,
    pub listeners: RwLock<Vec<Arc<dyn ServerListener>>>,
    pub version_policy: RwLock<Arc<dyn VersionPolicy>>,
    pub banned: RwLock<HashSet<String>>,
    pub remote: Arc<RemoteRegistry>,
    pub local_addr: SocketAddr,
    /// Taken by `start`; `None` once the accept loop owns it.
    pub(crate) listener: Mutex<Option<TcpListener>>,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}
