// src/core/session/listener.rs

//! Observer hooks for session events.

use super::SessionCore;
use crate::core::protocol::{ArgValue, Command};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// Receives events from a session. Every hook defaults to a no-op.
///
/// Hooks run on the session's reader task (or its writer task for
/// `on_timeout`), so they should return quickly and must not block.
pub trait SessionListener: Send + Sync + 'static {
    /// A command that the session did not consume itself.
    fn on_command(&self, _session: &SessionCore, _command: &Command) {}

    /// The session was closed by the peer or by a failure.
    fn on_disconnected(&self, _session: &SessionCore, _reason: &str) {}

    /// A retained session was resumed on a new link.
    fn on_reconnected(&self, _session: &SessionCore) {}

    /// The peer changed a property through `CL_UPDATE`.
    fn on_property_changed(
        &self,
        _session: &SessionCore,
        _key: &str,
        _old: Option<&ArgValue>,
        _new: &ArgValue,
    ) {
    }

    /// A remote call made from this session was cancelled by the callee.
    fn on_cancelled(&self, _session: &SessionCore, _response_id: &str) {}

    /// Nothing was received from the peer for too long.
    fn on_timeout(&self, _session: &SessionCore) {}
}

/// Handle returned by [`ListenerSet::add`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The listeners attached to one session.
///
/// Dispatch iterates over a snapshot, so a listener may add or remove
/// listeners (itself included) from inside a hook.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<dyn SessionListener>)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    /// Returns false if the listener was not attached.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        self.entries
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    /// Invokes `f` on every listener, isolating panics per listener.
    fn dispatch(&self, hook: &str, f: impl Fn(&dyn SessionListener)) {
        for listener in self.snapshot() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))) {
                error!(
                    "Session listener panicked in {hook}: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    pub fn notify_command(&self, session: &SessionCore, command: &Command) {
        self.dispatch("on_command", |l| l.on_command(session, command));
    }

    pub fn notify_disconnected(&self, session: &SessionCore, reason: &str) {
        self.dispatch("on_disconnected", |l| l.on_disconnected(session, reason));
    }

    pub fn notify_reconnected(&self, session: &SessionCore) {
        self.dispatch("on_reconnected", |l| l.on_reconnected(session));
    }

    pub fn notify_property_changed(
        &self,
        session: &SessionCore,
        key: &str,
        old: Option<&ArgValue>,
        new: &ArgValue,
    ) {
        self.dispatch("on_property_changed", |l| {
            l.on_property_changed(session, key, old, new)
        });
    }

    pub fn notify_cancelled(&self, session: &SessionCore, response_id: &str) {
        self.dispatch("on_cancelled", |l| l.on_cancelled(session, response_id));
    }

    pub fn notify_timeout(&self, session: &SessionCore) {
        self.dispatch("on_timeout", |l| l.on_timeout(session));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
