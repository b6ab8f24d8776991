// src/server/connection_loop.rs

//! Contains the main server loop for accepting connections and handling graceful shutdown.

use super::context::ServerContext;
use super::stream::AnyStream;
use crate::connection::handshake;
use crate::core::metrics;
use crate::core::session::{CloseReason, SessionRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The notice sessions receive when the server stops.
pub const SHUTDOWN_NOTICE: &str = "Server shutting down";

// How long `stop` waits for sessions to leave the registry.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

// Back-off after a failed accept, so a full fd table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts sockets until the server's shutdown token fires, then disconnects
/// every session before the listening socket is closed.
pub async fn run(ctx: Arc<ServerContext>, listener: TcpListener) {
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = ctx.shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections.");
                break;
            }

            res = listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        debug!("Accepted new connection from: {}", addr);
                        metrics::CONNECTIONS_ACCEPTED_TOTAL.inc();
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {addr}: {e}");
                        }

                        let conn_ctx = ctx.clone();
                        if let Some(acceptor) = ctx.acceptor.clone() {
                            handshakes.spawn(async move {
                                let deadline = conn_ctx.config.handshake_timeout;
                                match timeout(deadline, acceptor.accept(socket)).await {
                                    Ok(Ok(tls_stream)) => {
                                        debug!("TLS handshake successful for {addr}");
                                        let stream = AnyStream::Tls(Box::new(tls_stream));
                                        handshake::run(conn_ctx, stream, addr).await;
                                    }
                                    Ok(Err(e)) => warn!("TLS handshake error for {addr}: {e}"),
                                    Err(_) => warn!("TLS handshake with {addr} timed out."),
                                }
                            });
                        } else {
                            handshakes.spawn(handshake::run(conn_ctx, AnyStream::Tcp(socket), addr));
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            },

            Some(res) = handshakes.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A handshake task panicked: {e:?}");
                }
            },
        }
    }

    // In-flight handshakes release their registry reservations when aborted.
    handshakes.shutdown().await;
    disconnect_all(&ctx).await;
    drop(listener);
    info!("Server on {} stopped.", ctx.local_addr);
}

/// Closes every registered session with the shutdown notice and waits,
/// bounded, for the registry to empty.
pub async fn disconnect_all(ctx: &Arc<ServerContext>) {
    let sessions = ctx.registry.snapshot();
    if !sessions.is_empty() {
        info!("Disconnecting {} sessions.", sessions.len());
    }

    let closes = sessions.into_iter().map(|connection| {
        connection.close(CloseReason::Local(Some(SHUTDOWN_NOTICE.to_string())))
    });
    futures::future::join_all(closes).await;

    if !ctx.registry.wait_until_empty(STOP_TIMEOUT).await {
        warn!(
            "{} sessions did not leave the registry in time; dropping them.",
            ctx.registry.len()
        );
        ctx.registry.clear();
    }
}
