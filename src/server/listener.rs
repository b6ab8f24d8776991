// src/server/listener.rs

use super::Server;
use crate::connection::Connection;
use std::sync::Arc;

/// Observes session lifecycle events on a [`Server`].
///
/// Every hook has an empty default, so implementors override only what they
/// need. Hooks run on the task that caused the event; a panicking hook is
/// logged and does not affect other listeners.
pub trait ServerListener: Send + Sync + 'static {
    /// A new session completed its handshake.
    fn on_connected(&self, _server: &Server, _connection: &Arc<Connection>) {}

    /// A retained session was resumed on a new link.
    fn on_reconnected(&self, _server: &Server, _connection: &Arc<Connection>) {}

    /// A session lost its link, was kicked, or said goodbye.
    fn on_disconnected(&self, _server: &Server, _connection: &Arc<Connection>, _reason: &str) {}
}
