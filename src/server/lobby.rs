// src/server/lobby.rs

//! A minimal lobby: chat between connected players.

use super::{Server, ServerContext, ServerListener};
use crate::connection::Connection;
use crate::core::protocol::{Command, Reserved};
use crate::core::session::{SessionCore, SessionListener};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Relays every `MESSAGE` a player sends to all other connected players,
/// stamped with the sender's display name, and announces arrivals and
/// departures.
#[derive(Debug, Default)]
pub struct LobbyRelay;

impl ServerListener for LobbyRelay {
    fn on_connected(&self, server: &Server, connection: &Arc<Connection>) {
        // Session listeners survive a resume, so this runs once per session.
        connection.session().add_listener(Arc::new(MessageRelay {
            server: server.downgrade(),
        }));
        announce(server, connection, "joined");
    }

    fn on_reconnected(&self, server: &Server, connection: &Arc<Connection>) {
        announce(server, connection, "is back");
    }

    fn on_disconnected(&self, server: &Server, connection: &Arc<Connection>, _reason: &str) {
        announce(server, connection, "left");
    }
}

fn announce(server: &Server, connection: &Connection, what: &str) {
    let notice = Command::new(Reserved::Message)
        .with("from", "server")
        .with("text", format!("{} {what}", connection.session().display_name()));
    server.broadcast_except(notice, connection.name());
}

struct MessageRelay {
    server: Weak<ServerContext>,
}

impl SessionListener for MessageRelay {
    fn on_command(&self, session: &SessionCore, command: &Command) {
        if !command.is(Reserved::Message) {
            return;
        }
        let Some(ctx) = self.server.upgrade() else {
            return;
        };
        let mut relayed = command.clone();
        relayed.put("from", session.display_name());
        let delivered = Server::from_context(ctx).broadcast_except(relayed, session.name());
        debug!(
            "Relayed message from '{}' to {delivered} players.",
            session.name()
        );
    }
}
