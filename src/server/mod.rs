// src/server/mod.rs

//! The accepting side of the protocol: binds a socket, admits clients through
//! the handshake, and keeps the name → session registry.

use crate::config::Config;
use crate::connection::{Connection, VersionPolicy};
use crate::core::SessionError;
use crate::core::protocol::Command;
use crate::core::rpc::RemoteRegistry;
use crate::core::session::listener::panic_message;
use anyhow::Result;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

mod connection_loop;
mod context;
mod initialization;
mod listener;
mod lobby;
mod metrics_server;
mod registry;
mod stream;

pub use connection_loop::SHUTDOWN_NOTICE;
pub use context::ServerContext;
pub use listener::ServerListener;
pub use lobby::LobbyRelay;
pub use registry::SessionRegistry;
pub use stream::AnyStream;

pub(crate) use initialization::load_certs;

/// A handle to a running (or bound) server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerContext>,
}

impl Server {
    /// Binds the listening socket. Connections are accepted once `start` is called.
    pub async fn bind(config: Config) -> Result<Self> {
        Self::bind_with(config, Arc::new(RemoteRegistry::new())).await
    }

    /// Binds with a remote-object registry shared by every connection.
    pub async fn bind_with(config: Config, remote: Arc<RemoteRegistry>) -> Result<Self> {
        config.validate()?;
        let ctx = initialization::setup(config, remote).await?;
        Ok(Self {
            shared: Arc::new(ctx),
        })
    }

    pub(crate) fn from_context(shared: Arc<ServerContext>) -> Self {
        Self { shared }
    }

    pub(crate) fn context(&self) -> &Arc<ServerContext> {
        &self.shared
    }

    pub(crate) fn downgrade(&self) -> Weak<ServerContext> {
        Arc::downgrade(&self.shared)
    }

    /// Runs `f` for every server listener, isolating panics.
    pub(crate) fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn ServerListener),
    {
        let snapshot: Vec<_> = self.shared.listeners.read().clone();
        for listener in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                error!(
                    "Server listener panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Spawns the accept loop, and the metrics endpoint if enabled.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SessionError::InvalidState(
                "server has been stopped".to_string(),
            ));
        }
        let listener = self.shared.listener.lock().take().ok_or_else(|| {
            SessionError::InvalidState("server is already started".to_string())
        })?;

        let mut tasks = self.shared.tasks.lock();
        tasks.push(tokio::spawn(connection_loop::run(
            self.shared.clone(),
            listener,
        )));
        if self.shared.config.metrics.enabled {
            tasks.push(tokio::spawn(metrics_server::run_metrics_server(
                self.downgrade(),
                self.shared.config.metrics.port,
                self.shared.shutdown.clone(),
            )));
        }
        info!("Server on {} started.", self.shared.local_addr);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_cancelled() && !self.shared.tasks.lock().is_empty()
    }

    /// Disconnects every session, waits (bounded) for the registry to empty,
    /// then closes the listening socket. A stopped server cannot be restarted.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        if tasks.is_empty() {
            // Never started: there is no accept loop to do the teardown.
            connection_loop::disconnect_all(&self.shared).await;
            self.shared.listener.lock().take();
            return;
        }
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                error!("A server task panicked during shutdown: {e:?}");
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        self.shared.listeners.write().push(listener);
    }

    pub fn set_version_policy(&self, policy: Arc<dyn VersionPolicy>) {
        *self.shared.version_policy.write() = policy;
    }

    /// The session registered under `name`, connected or retained.
    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.shared.registry.get(name)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.snapshot()
    }

    pub fn connected_count(&self) -> usize {
        self.shared.registry.connected_count()
    }

    pub fn send_to(&self, name: &str, command: Command) -> Result<(), SessionError> {
        match self.connection(name) {
            Some(connection) => connection.send(command),
            None => {
                warn!("send_to: no session named '{name}'.");
                Err(SessionError::NotConnected)
            }
        }
    }

    /// Sends `command` to every connected session. Returns how many took it.
    pub fn broadcast(&self, command: Command) -> usize {
        self.broadcast_filtered(command, |_| true)
    }

    /// Sends `command` to every connected session except `name`.
    pub fn broadcast_except(&self, command: Command, name: &str) -> usize {
        self.broadcast_filtered(command, |c| c.name() != name)
    }

    fn broadcast_filtered<F>(&self, command: Command, include: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        self.shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| c.is_connected() && include(c))
            .filter(|c| c.send(command.clone()).is_ok())
            .count()
    }

    /// Disconnects `name` with `reason` and forgets its session.
    pub async fn kick(&self, name: &str, reason: &str) -> bool {
        match self.connection(name) {
            Some(connection) => {
                info!("Kicking '{name}': {reason}");
                connection.kick(reason).await;
                true
            }
            None => false,
        }
    }

    /// Refuses future handshakes for `name` and kicks its current session.
    pub async fn ban(&self, name: &str) {
        self.shared.banned.write().insert(name.to_string());
        self.kick(name, &format!("'{name}' is banned")).await;
    }

    pub fn unban(&self, name: &str) -> bool {
        self.shared.banned.write().remove(name)
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.shared.banned.read().contains(name)
    }

    /// The remote-object registry served to every connection.
    pub fn remote(&self) -> &Arc<RemoteRegistry> {
        &self.shared.remote
    }
}

/// The main server startup function used by the binary: a lobby that relays
/// `MESSAGE` commands between players until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let server = Server::bind(config).await?;
    server.add_listener(Arc::new(LobbyRelay));
    server.start()?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }

    server.stop().await;
    info!("Server shutdown complete.");
    Ok(())
}
