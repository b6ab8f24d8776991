// src/core/session/mod.rs

//! State shared by both ends of a connection.
//!
//! A [`SessionCore`] outlives individual links: a server-side session keeps
//! its attributes and listeners across a reconnection, and a client session
//! keeps them across `disconnect`/`connect`. Each link contributes one
//! outbound queue (writer task) and one reader task.

pub mod listener;
pub mod outbound;
pub(crate) mod reader;

pub use listener::{ListenerId, ListenerSet, SessionListener};
pub use outbound::{OutboundQueue, QueueHooks};

use crate::core::SessionError;
use crate::core::protocol::{ArgValue, CodecKind, Command, CommandCodec, Reserved};
use crate::core::rpc::caller::{self, PendingCalls};
use crate::core::rpc::{JsonSerializer, ObjectSerializer, RemoteRegistry, RpcOutcome, RpcValue};
use async_trait::async_trait;
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strum_macros::Display;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A peer that has been silent for this many keep-alive intervals is dropped.
pub const SILENCE_FACTOR: u32 = 3;

/// The close reason used when the silence limit is exceeded.
pub const TIMED_OUT: &str = "Connection timed out";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Ready,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Connecting or connected.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// This side closes. `Some` carries a notice for the peer.
    Local(Option<String>),
    /// The peer sent a disconnect command with this message.
    PeerDisconnect(String),
    /// The link failed: I/O error, corrupt input or silence.
    Failure(String),
}

impl CloseReason {
    pub fn message(&self) -> &str {
        match self {
            CloseReason::Local(notice) => notice.as_deref().unwrap_or(""),
            CloseReason::PeerDisconnect(message) | CloseReason::Failure(message) => message,
        }
    }
}

/// One side's behavior on top of the shared session machinery.
#[async_trait]
pub trait SessionRole: Send + Sync + 'static {
    fn core(&self) -> &Arc<SessionCore>;

    /// Handles a command the reader does not handle itself. Returning the
    /// command passes it on to the session listeners.
    async fn on_control(self: Arc<Self>, command: Command) -> Option<Command> {
        Some(command)
    }

    /// Tears the session down. Must be idempotent.
    async fn close(self: Arc<Self>, reason: CloseReason);
}

struct Link {
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
}

/// The state common to server-side connections and client sessions.
pub struct SessionCore {
    name: String,
    codec: CodecKind,
    attributes: RwLock<IndexMap<String, ArgValue>>,
    listeners: ListenerSet,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    pending: PendingCalls,
    remote: Arc<RemoteRegistry>,
    serializer: RwLock<Arc<dyn ObjectSerializer>>,
    keep_alive_ms: AtomicU64,
    last_received: Mutex<Instant>,
    last_round_trip: Mutex<Option<Duration>>,
    close_reason: Mutex<Option<String>>,
}

impl SessionCore {
    pub fn new(
        name: impl Into<String>,
        codec: CodecKind,
        keep_alive: Duration,
        remote: Arc<RemoteRegistry>,
    ) -> Self {
        let name = name.into();
        let mut attributes = IndexMap::new();
        attributes.insert("name".to_string(), ArgValue::Str(name.clone()));
        let (state, _) = watch::channel(ConnectionState::Ready);
        Self {
            name,
            codec,
            attributes: RwLock::new(attributes),
            listeners: ListenerSet::new(),
            state,
            link: Mutex::new(None),
            pending: PendingCalls::new(),
            remote,
            serializer: RwLock::new(Arc::new(JsonSerializer)),
            keep_alive_ms: AtomicU64::new(keep_alive.as_millis() as u64),
            last_received: Mutex::new(Instant::now()),
            last_round_trip: Mutex::new(None),
            close_reason: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Moves to `to` only if the current state is one of `from`.
    pub(crate) fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    pub fn attribute(&self, key: &str) -> Option<ArgValue> {
        self.attributes.read().get(key).cloned()
    }

    pub fn attributes(&self) -> IndexMap<String, ArgValue> {
        self.attributes.read().clone()
    }

    /// Sets an attribute locally, returning the previous value.
    pub fn set_attribute(&self, key: &str, value: impl Into<ArgValue>) -> Option<ArgValue> {
        self.attributes.write().insert(key.to_string(), value.into())
    }

    /// The `displayName` attribute, falling back to the session name.
    pub fn display_name(&self) -> String {
        self.attribute("displayName")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn remote(&self) -> &Arc<RemoteRegistry> {
        &self.remote
    }

    pub fn serializer(&self) -> Arc<dyn ObjectSerializer> {
        self.serializer.read().clone()
    }

    pub fn set_serializer(&self, serializer: Arc<dyn ObjectSerializer>) {
        *self.serializer.write() = serializer;
    }

    pub fn pending_calls(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.load(Ordering::Relaxed))
    }

    /// Changes the keep-alive interval, including on the live link.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        self.keep_alive_ms
            .store(keep_alive.as_millis() as u64, Ordering::Relaxed);
        if let Some(link) = self.link.lock().as_ref() {
            link.queue.set_timeout(keep_alive);
        }
    }

    /// The latest round trip measured by a keep-alive ping.
    pub fn last_round_trip(&self) -> Option<Duration> {
        *self.last_round_trip.lock()
    }

    /// Time since the last command arrived on the current link.
    pub fn silence(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// Why the session last closed, if it has.
    pub fn last_close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub(crate) fn record_close_reason(&self, reason: &str) {
        *self.close_reason.lock() = Some(reason.to_string());
    }

    /// Queues a command for the peer. Fails unless the session is connected.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        if !self.is_connected() {
            warn!(
                "Session '{}': not connected, dropping {}.",
                self.name,
                command.name()
            );
            return Err(SessionError::NotConnected);
        }
        self.enqueue(command)
    }

    /// Queues a command regardless of state, as long as a link exists.
    pub(crate) fn enqueue(&self, command: Command) -> Result<(), SessionError> {
        match self.link.lock().as_ref() {
            Some(link) => link.queue.enqueue(command),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Calls `method` on the object registered as `target` at the peer.
    pub async fn invoke(
        &self,
        target: &str,
        method: &str,
        expects_result: bool,
        args: Vec<RpcValue>,
    ) -> Result<RpcOutcome, SessionError> {
        caller::invoke(self, target, method, expects_result, args).await
    }

    pub(crate) fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// Echoes a probe, or records the round trip of an answered one.
    pub(crate) fn answer_ping(&self, mut ping: Command) {
        if ping.get_bool_or("pong", false) {
            if let Ok(sent) = ping.get_i64("sent") {
                let rtt = unix_millis().saturating_sub(sent).max(0) as u64;
                *self.last_round_trip.lock() = Some(Duration::from_millis(rtt));
            }
            return;
        }
        // Marked so the peer records it instead of echoing it back again.
        ping.put("pong", true);
        if let Err(e) = self.enqueue(ping) {
            debug!("Session '{}': could not answer ping: {e}", self.name);
        }
    }

    pub(crate) fn send_ping(&self) {
        let ping = Command::new(Reserved::Ping).with("sent", unix_millis());
        if let Err(e) = self.enqueue(ping) {
            debug!("Session '{}': could not send ping: {e}", self.name);
        }
    }

    /// Merges a `CL_UPDATE` into the attributes and notifies listeners.
    pub(crate) fn apply_update(&self, update: &Command) {
        for (key, value) in update.arguments() {
            if key == "name" {
                warn!("Session '{}': ignoring attempt to rename via update.", self.name);
                continue;
            }
            let old = self
                .attributes
                .write()
                .insert(key.to_string(), value.clone());
            self.listeners
                .notify_property_changed(self, key, old.as_ref(), value);
        }
    }

    /// Tears down the current link.
    ///
    /// Returns false if the session was not live, in which case nothing
    /// happens. A `farewell` replaces anything still queued and is flushed
    /// (best effort) before the link closes. `reason` is recorded before the
    /// session reaches `DISCONNECTED`.
    pub(crate) async fn shutdown_link(&self, farewell: Option<Command>, reason: &str) -> bool {
        if !self.transition(
            &[ConnectionState::Connecting, ConnectionState::Connected],
            ConnectionState::Disconnecting,
        ) {
            return false;
        }

        let link = self.link.lock().take();
        if let Some(link) = link {
            if let Some(farewell) = farewell {
                link.queue.clear();
                if let Err(e) = link.queue.enqueue(farewell) {
                    debug!("Session '{}': farewell not sent: {e}", self.name);
                }
            }
            link.cancel.cancel();
            link.queue.stop().await;
        }
        self.pending.fail_all();
        self.record_close_reason(reason);
        self.set_state(ConnectionState::Disconnected);
        true
    }
}

/// Binds a fresh link to `role`'s session.
///
/// `greeting` is queued first, the session moves to `state`, and only then
/// does the reader start, so nothing is dispatched before the session is in
/// its new state.
pub(crate) fn attach_link<R, T>(
    role: &Arc<R>,
    framed: Framed<T, CommandCodec>,
    greeting: Command,
    state: ConnectionState,
) -> Result<(), SessionError>
where
    R: SessionRole,
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let core = role.core();
    let (sink, stream) = framed.split();
    let queue = Arc::new(OutboundQueue::new(core.keep_alive()));
    let hooks = Arc::new(LinkHooks {
        role: Arc::downgrade(role),
    });
    queue.start(sink, hooks)?;
    queue.enqueue(greeting)?;

    let cancel = CancellationToken::new();
    *core.link.lock() = Some(Link {
        queue,
        cancel: cancel.clone(),
    });
    core.touch();
    core.set_state(state);

    tokio::spawn(reader::read_loop(role.clone(), stream, cancel));
    Ok(())
}

struct LinkHooks<R> {
    role: Weak<R>,
}

impl<R: SessionRole> QueueHooks for LinkHooks<R> {
    fn on_idle(&self) {
        let Some(role) = self.role.upgrade() else {
            return;
        };
        let core = role.core();
        if !core.is_connected() {
            return;
        }
        if core.silence() >= core.keep_alive() * SILENCE_FACTOR {
            warn!(
                "Session '{}': nothing received for {:?}, timing out.",
                core.name(),
                core.silence()
            );
            core.listeners().notify_timeout(core);
            tokio::spawn(role.close(CloseReason::Failure(TIMED_OUT.to_string())));
        } else {
            core.send_ping();
        }
    }

    fn on_write_failed(&self, error: &SessionError) {
        let Some(role) = self.role.upgrade() else {
            return;
        };
        if role.core().state().is_live() {
            tokio::spawn(role.close(CloseReason::Failure(error.to_string())));
        }
    }
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
