// src/connection/session.rs

//! Defines `Connection`, the server's side of one named client session.

use crate::core::protocol::{Command, CommandCodec, Reserved};
use crate::core::rpc::{RpcOutcome, RpcValue};
use crate::core::session::{self, CloseReason, ConnectionState, SessionCore, SessionRole};
use crate::core::{SessionError, metrics};
use crate::server::{Server, ServerContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{info, warn};
use uuid::Uuid;

// Handshake keys that are not stored as session attributes.
const PRIVATE_KEYS: [&str; 3] = ["name", "password", "resumeToken"];

/// A client session as seen by the server.
///
/// The object survives link loss: when the same client reconnects, the
/// server rebinds this connection to the new socket, so its attributes and
/// listeners carry over.
pub struct Connection {
    core: Arc<SessionCore>,
    server: Weak<ServerContext>,
    resume_token: Mutex<String>,
    peer_addr: Mutex<Option<SocketAddr>>,
    retained_since: Mutex<Option<Instant>>,
}

impl Connection {
    pub(crate) fn new(name: &str, server: &Arc<ServerContext>) -> Arc<Self> {
        let core = SessionCore::new(
            name,
            server.config.codec,
            server.config.keep_alive,
            server.remote.clone(),
        );
        Arc::new(Self {
            core: Arc::new(core),
            server: Arc::downgrade(server),
            resume_token: Mutex::new(String::new()),
            peer_addr: Mutex::new(None),
            retained_since: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The address of the socket currently (or last) bound to this session.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        self.core.send(command)
    }

    pub async fn invoke(
        &self,
        target: &str,
        method: &str,
        expects_result: bool,
        args: Vec<RpcValue>,
    ) -> Result<RpcOutcome, SessionError> {
        self.core.invoke(target, method, expects_result, args).await
    }

    /// Disconnects the client, telling it why. The session is forgotten.
    pub async fn kick(self: &Arc<Self>, reason: &str) {
        self.clone()
            .close(CloseReason::Local(Some(reason.to_string())))
            .await;
    }

    pub(crate) fn resume_token(&self) -> String {
        self.resume_token.lock().clone()
    }

    /// True if the session was retained after a link failure longer ago than `window`.
    pub(crate) fn retention_expired(&self, window: Duration) -> bool {
        self.retained_since
            .lock()
            .is_some_and(|since| since.elapsed() >= window)
    }

    /// Copies the handshake arguments into the session attributes.
    pub(crate) fn absorb_hello(&self, hello: &Command, addr: SocketAddr) {
        for (key, value) in hello.arguments() {
            if !PRIVATE_KEYS.contains(&key) {
                self.core.set_attribute(key, value.clone());
            }
        }
        *self.peer_addr.lock() = Some(addr);
    }

    /// Binds a freshly handshaken link, confirms the connection to the client,
    /// and fires the connected or reconnected hooks.
    pub(crate) fn activate<T>(
        self: &Arc<Self>,
        framed: Framed<T, CommandCodec>,
        resumed: bool,
    ) -> Result<(), SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let token = Uuid::new_v4().simple().to_string();
        *self.resume_token.lock() = token.clone();
        *self.retained_since.lock() = None;

        let confirmation = Command::new(Reserved::SvrConnected)
            .with("keepAlive", self.core.keep_alive().as_millis() as u64)
            .with("name", self.name())
            .with("resumeToken", token)
            .with("resumed", resumed);
        session::attach_link(self, framed, confirmation, ConnectionState::Connected)?;
        metrics::CONNECTED_SESSIONS.inc();

        info!(
            "Session '{}' {} from {}.",
            self.name(),
            if resumed { "resumed" } else { "connected" },
            self.peer_addr()
                .map_or_else(|| "unknown address".to_string(), |a| a.to_string())
        );

        if let Some(ctx) = self.server.upgrade() {
            let server = Server::from_context(ctx);
            if resumed {
                self.core.listeners().notify_reconnected(&self.core);
                server.notify(|l| l.on_reconnected(&server, self));
            } else {
                server.notify(|l| l.on_connected(&server, self));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionRole for Connection {
    fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    async fn on_control(self: Arc<Self>, command: Command) -> Option<Command> {
        match command.reserved() {
            Some(
                Reserved::ClConnect
                | Reserved::ClReconnect
                | Reserved::Password
                | Reserved::SvrConnected,
            ) => {
                warn!(
                    "Session '{}': ignoring handshake command {} on a live link.",
                    self.name(),
                    command.name()
                );
                None
            }
            _ => Some(command),
        }
    }

    async fn close(self: Arc<Self>, reason: CloseReason) {
        let farewell = match &reason {
            CloseReason::Local(Some(notice)) => {
                Some(Command::new(Reserved::SvrDisconnect).with("message", notice.as_str()))
            }
            _ => None,
        };
        // Sessions lost to a failure stay registered so the client can resume them.
        let retain = matches!(reason, CloseReason::Failure(_));
        let server = self.server.upgrade().map(Server::from_context);
        let was_connected = self.core.is_connected();

        let message = reason.message();
        if !self.core.shutdown_link(farewell, message).await {
            // Already closed. A retained session can still be dropped explicitly.
            if !retain
                && let Some(server) = &server
                && server.context().registry.remove(&self)
            {
                info!("Retained session '{}' discarded.", self.name());
            }
            return;
        }
        if was_connected {
            metrics::CONNECTED_SESSIONS.dec();
        }

        match &reason {
            CloseReason::Failure(_) => {
                *self.retained_since.lock() = Some(Instant::now());
                info!("Session '{}' lost its link: {message}", self.name());
            }
            _ => info!("Session '{}' disconnected: {message}", self.name()),
        }

        if !matches!(reason, CloseReason::Local(_)) {
            self.core.listeners().notify_disconnected(&self.core, message);
        }
        if let Some(server) = server {
            if !retain {
                server.context().registry.remove(&self);
            }
            server.notify(|l| l.on_disconnected(&server, &self, message));
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

