// src/server/registry.rs

//! The name → session map of a server.

use super::context::ServerContext;
use crate::connection::handshake::Resolution;
use crate::connection::{Connection, Rejection};
use crate::core::ConnectionState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Every session a server knows about, keyed by client name.
///
/// All reads and writes go through one lock. Entries are either live
/// (connecting or connected) or retained after a link failure, waiting to be
/// resumed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Connection>>>,
    removed: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides what a handshake for `name` binds to.
    ///
    /// On success the chosen session has already been moved to `CONNECTING`
    /// under the registry lock, so a concurrent handshake for the same name
    /// sees it as taken.
    pub(crate) fn resolve(
        &self,
        ctx: &Arc<ServerContext>,
        name: &str,
        token: Option<&str>,
    ) -> Result<Resolution, Rejection> {
        let mut sessions = self.sessions.lock();
        let window = ctx.config.reconnect_window;
        sessions.retain(|retained, connection| {
            let expired = connection.state() == ConnectionState::Disconnected
                && connection.retention_expired(window);
            if expired {
                info!("Retained session '{retained}' expired.");
            }
            !expired
        });

        if let Some(existing) = sessions.get(name).cloned() {
            match existing.state() {
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnecting => {
                    return Err(Rejection::Duplicate(name.to_string()));
                }
                ConnectionState::Ready | ConnectionState::Disconnected => {
                    let resumable = match token {
                        Some(token) if token == existing.resume_token() => true,
                        Some(_) => return Err(Rejection::ResumeToken(name.to_string())),
                        None => !ctx.config.require_resume_token,
                    };
                    if resumable {
                        existing.session().set_state(ConnectionState::Connecting);
                        return Ok(Resolution::Resumed(existing));
                    }
                    debug!("Fresh connect for '{name}' replaces its retained session.");
                    sessions.remove(name);
                    self.removed.notify_waiters();
                }
            }
        }

        let live = sessions.values().filter(|c| c.state().is_live()).count();
        if live >= ctx.config.max_connections {
            return Err(Rejection::Capacity);
        }

        let connection = Connection::new(name, ctx);
        connection.session().set_state(ConnectionState::Connecting);
        sessions.insert(name.to_string(), connection.clone());
        Ok(Resolution::New(connection))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.sessions.lock().get(name).cloned()
    }

    /// A point-in-time copy of every registered session.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Removes `connection`, but only if it is still the entry for its name.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(connection.name()) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    sessions.remove(connection.name());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.removed.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Sessions that are connecting or connected.
    pub fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|c| c.state().is_live())
            .count()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Waits until every session has been removed, or `timeout` passes.
    /// Returns true if the registry emptied.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.sessions.lock().clear();
        self.removed.notify_waiters();
    }
}
