// src/client/mod.rs

//! The initiating side of the protocol.
//!
//! A [`ClientSession`] moves through `READY → CONNECTING → CONNECTED →
//! DISCONNECTING → DISCONNECTED`. Connecting again from `DISCONNECTED` asks
//! the server to resume the previous session; `reset` goes back to `READY`
//! so the next connect starts a fresh one.

mod tls;

use crate::config::ClientConfig;
use crate::core::protocol::{ArgValue, Command, CommandCodec, HANDSHAKE_MAGIC, Reserved};
use crate::core::rpc::{RemoteRegistry, RpcOutcome, RpcValue};
use crate::core::session::{
    self, CloseReason, ConnectionState, ListenerId, SessionCore, SessionListener, SessionRole,
};
use crate::core::SessionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// A client's connection to a server.
pub struct ClientSession {
    role: Arc<ClientRole>,
}

struct ClientRole {
    core: Arc<SessionCore>,
    config: ClientConfig,
    resume_token: Mutex<Option<String>>,
    // Set once the server has confirmed a connect; cleared by `reset`.
    has_connected: AtomicBool,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_registry(config, Arc::new(RemoteRegistry::new()))
    }

    /// Creates a session whose peer may call into the objects in `remote`.
    pub fn with_registry(config: ClientConfig, remote: Arc<RemoteRegistry>) -> Self {
        let core = SessionCore::new(&config.name, config.codec, config.keep_alive, remote);
        if let Some(display_name) = &config.display_name {
            core.set_attribute("displayName", display_name.as_str());
        }
        for (key, value) in &config.properties {
            core.set_attribute(key, value.as_str());
        }
        Self {
            role: Arc::new(ClientRole {
                core: Arc::new(core),
                config,
                resume_token: Mutex::new(None),
                has_connected: AtomicBool::new(false),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Opens a link and performs the handshake.
    ///
    /// Returns once the server has confirmed the session. A rejection is
    /// returned as `SessionError::Protocol` carrying the server's reason.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let _serial = self.role.connect_lock.lock().await;
        let core = &self.role.core;
        if !core.transition(
            &[ConnectionState::Ready, ConnectionState::Disconnected],
            ConnectionState::Connecting,
        ) {
            return Err(SessionError::InvalidState(format!(
                "cannot connect while {}",
                core.state()
            )));
        }

        let limit = self.role.config.connect_timeout;
        let result = match timeout(limit, self.role.clone().establish()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "no confirmation from {}:{} within {limit:?}",
                self.role.config.host, self.role.config.port
            ))),
        };
        if let Err(e) = &result {
            self.role.abort_connect(e).await;
        }
        result
    }

    /// Says goodbye to the server and closes the link.
    ///
    /// Session listeners are not told about a disconnect the application
    /// asked for.
    pub async fn disconnect(&self) {
        self.role.clone().close(CloseReason::Local(None)).await;
    }

    /// Forgets the previous session, so the next `connect` starts a new one.
    pub fn reset(&self) -> Result<(), SessionError> {
        let core = &self.role.core;
        if !core.transition(
            &[ConnectionState::Disconnected, ConnectionState::Ready],
            ConnectionState::Ready,
        ) {
            return Err(SessionError::InvalidState(format!(
                "cannot reset while {}",
                core.state()
            )));
        }
        self.role.has_connected.store(false, Ordering::SeqCst);
        *self.role.resume_token.lock() = None;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.role.core.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.role.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.role.core.is_connected()
    }

    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        self.role.core.send(command)
    }

    pub async fn invoke(
        &self,
        target: &str,
        method: &str,
        expects_result: bool,
        args: Vec<RpcValue>,
    ) -> Result<RpcOutcome, SessionError> {
        self.role.core.invoke(target, method, expects_result, args).await
    }

    /// Sets a property locally and, when connected, on the server's side of
    /// the session. Offline changes travel with the next handshake.
    pub fn set_property(&self, key: &str, value: impl Into<ArgValue>) -> Result<(), SessionError> {
        let value = value.into();
        self.role.core.set_attribute(key, value.clone());
        if self.is_connected() {
            self.role
                .core
                .send(Command::new(Reserved::ClUpdate).with(key, value))?;
        }
        Ok(())
    }

    /// The interval currently used for keep-alive pings.
    pub fn keep_alive(&self) -> Duration {
        self.role.core.keep_alive()
    }

    /// The shared session state: attributes, listeners, remote objects.
    pub fn session(&self) -> &Arc<SessionCore> {
        &self.role.core
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        self.role.core.add_listener(listener)
    }
}

impl ClientRole {
    async fn establish(self: Arc<Self>) -> Result<(), SessionError> {
        let mut state = self.core.subscribe_state();

        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("Connecting to {addr} as '{}'.", self.core.name());
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;
        let mut stream = tls::wrap(&self.config, tcp).await?;
        stream.write_u64(HANDSHAKE_MAGIC).await?;

        let framed = Framed::new(stream, CommandCodec::new(self.config.codec));
        session::attach_link(&self, framed, self.hello(), ConnectionState::Connecting)?;

        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    let reason = self
                        .core
                        .last_close_reason()
                        .unwrap_or_else(|| "Connection closed during handshake".to_string());
                    return Err(SessionError::Protocol(reason));
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(SessionError::Internal("session state channel closed".into()));
            }
        }
    }

    /// The connect command: every attribute, the version, and the resume
    /// token when a previous session may be resumed.
    fn hello(&self) -> Command {
        let token = self.resume_token.lock().clone();
        let token = token.filter(|_| self.has_connected.load(Ordering::SeqCst));
        let kind = if token.is_some() {
            Reserved::ClReconnect
        } else {
            Reserved::ClConnect
        };

        let mut hello = Command::new(kind);
        for (key, value) in self.core.attributes() {
            hello.put(key, value);
        }
        hello.put("version", self.config.version.as_str());
        if let Some(token) = token {
            hello.put("resumeToken", token);
        }
        hello
    }

    /// Leaves the session `DISCONNECTED` after a failed connect.
    async fn abort_connect(self: &Arc<Self>, error: &SessionError) {
        debug!("Connect for '{}' failed: {error}", self.core.name());
        let reason = error.to_string();
        // A link may already be attached; tear it down quietly.
        if !self.core.shutdown_link(None, &reason).await
            && self
                .core
                .transition(&[ConnectionState::Connecting], ConnectionState::Disconnected)
        {
            self.core.record_close_reason(&reason);
        }
    }

    fn answer_password(&self) {
        let password = self.config.password.clone().unwrap_or_default();
        let reply = Command::new(Reserved::Password).with("password", password);
        if let Err(e) = self.core.enqueue(reply) {
            warn!("Session '{}': could not answer password request: {e}", self.core.name());
        }
    }
}

#[async_trait]
impl SessionRole for ClientRole {
    fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    async fn on_control(self: Arc<Self>, command: Command) -> Option<Command> {
        match command.reserved() {
            Some(Reserved::SvrConnected) => {
                if let Ok(ms) = command.get_i64("keepAlive")
                    && ms > 0
                {
                    self.core.set_keep_alive(Duration::from_millis(ms as u64));
                }
                if let Some(token) = command.get_str("resumeToken") {
                    *self.resume_token.lock() = Some(token);
                }
                self.has_connected.store(true, Ordering::SeqCst);
                let resumed = command.get_bool_or("resumed", false);
                if self
                    .core
                    .transition(&[ConnectionState::Connecting], ConnectionState::Connected)
                {
                    info!(
                        "Session '{}' {} (keep-alive {:?}).",
                        self.core.name(),
                        if resumed { "resumed" } else { "connected" },
                        self.core.keep_alive()
                    );
                    if resumed {
                        self.core.listeners().notify_reconnected(&self.core);
                    }
                }
                None
            }
            Some(Reserved::Password) => {
                self.answer_password();
                None
            }
            _ => Some(command),
        }
    }

    async fn close(self: Arc<Self>, reason: CloseReason) {
        let farewell = match &reason {
            CloseReason::Local(notice) => {
                let mut farewell = Command::new(Reserved::ClDisconnect);
                if let Some(notice) = notice {
                    farewell.put("message", notice.as_str());
                }
                Some(farewell)
            }
            _ => None,
        };
        let was_connected = self.core.is_connected();
        let message = reason.message();
        if !self.core.shutdown_link(farewell, message).await {
            return;
        }

        match &reason {
            CloseReason::Local(_) => info!("Session '{}' disconnected.", self.core.name()),
            _ => info!("Session '{}' closed: {message}", self.core.name()),
        }
        if was_connected && !matches!(reason, CloseReason::Local(_)) {
            self.core.listeners().notify_disconnected(&self.core, message);
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("server", &format!("{}:{}", self.role.config.host, self.role.config.port))
            .finish()
    }
}
