// src/connection/guard.rs

//! Defines `AdmissionGuard`, an RAII guard for registry reservations.

use super::session::Connection;
use crate::core::ConnectionState;
use crate::server::ServerContext;
use std::sync::Arc;
use tracing::debug;

/// Holds the registry slot a handshake reserved until the session is activated.
///
/// If the handshake task ends before `commit` (an activation error, or the
/// task being aborted during server shutdown), the reservation is released:
/// a new session is removed, a resumed one goes back to being retained.
pub(crate) struct AdmissionGuard {
    ctx: Arc<ServerContext>,
    connection: Arc<Connection>,
    resumed: bool,
    committed: bool,
}

impl AdmissionGuard {
    pub(crate) fn new(ctx: Arc<ServerContext>, connection: Arc<Connection>, resumed: bool) -> Self {
        Self {
            ctx,
            connection,
            resumed,
            committed: false,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn resumed(&self) -> bool {
        self.resumed
    }

    /// The session is live; keep the reservation.
    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let session = self.connection.session();
        if !session.transition(&[ConnectionState::Connecting], ConnectionState::Disconnected) {
            return;
        }
        debug!(
            "Releasing reservation for '{}' after an incomplete handshake.",
            self.connection.name()
        );
        if !self.resumed {
            self.ctx.registry.remove(&self.connection);
        }
    }
}
