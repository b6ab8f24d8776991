// src/core/session/reader.rs

//! The per-link reader task and the built-in command dispatch.

use super::{CloseReason, SessionRole};
use crate::core::protocol::{Command, Reserved};
use crate::core::rpc::callee;
use crate::core::{SessionError, metrics};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

enum Flow {
    Continue,
    Stop,
}

/// Reads commands until the link is cancelled, closed, or fails.
pub(crate) async fn read_loop<R, S>(role: Arc<R>, mut stream: S, cancel: CancellationToken)
where
    R: SessionRole,
    S: Stream<Item = Result<Command, SessionError>> + Unpin + Send,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let result = match next {
            Some(Ok(command)) => {
                role.core().touch();
                metrics::COMMANDS_RECEIVED_TOTAL.inc();
                dispatch(&role, command, &cancel).await
            }
            Some(Err(e)) => Err(e),
            None => Err(SessionError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )))),
        };

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(e) => {
                let core = role.core();
                if cancel.is_cancelled() || !core.state().is_live() {
                    // The final read of a link that is already going away.
                    debug!("Session '{}': ignoring read error after close: {e}", core.name());
                } else {
                    if e.is_normal_disconnect() {
                        debug!("Session '{}': link closed: {e}", core.name());
                    } else {
                        warn!("Session '{}': link failed: {e}", core.name());
                    }
                    role.clone().close(CloseReason::Failure(e.to_string())).await;
                }
                break;
            }
        }
    }
    debug!("Session '{}': reader finished.", role.core().name());
}

async fn dispatch<R: SessionRole>(
    role: &Arc<R>,
    command: Command,
    cancel: &CancellationToken,
) -> Result<Flow, SessionError> {
    let core = role.core();
    debug!("Session '{}': received {}", core.name(), command.name());

    match command.reserved() {
        Some(Reserved::Ping) => core.answer_ping(command),
        Some(reserved) if reserved.is_disconnect() => {
            let reason = command.get_str("message").unwrap_or_default();
            role.clone()
                .close(CloseReason::PeerDisconnect(reason))
                .await;
            return Ok(Flow::Stop);
        }
        Some(Reserved::ClError) => {
            warn!(
                "Session '{}': peer reported an error: {}",
                core.name(),
                command.get_str("message").unwrap_or_default()
            );
        }
        Some(Reserved::ClUpdate) => core.apply_update(&command),
        Some(Reserved::SvrExecuteRemote) => callee::handle_execute(core, command, cancel),
        Some(Reserved::SvrRemoteResult) => {
            let serializer = core.serializer();
            if let Some(unclaimed) = core.pending_calls().resolve(serializer.as_ref(), command) {
                core.listeners().notify_command(core, &unclaimed);
            }
        }
        _ => {
            if let Some(command) = role.clone().on_control(command).await {
                core.listeners().notify_command(core, &command);
            }
        }
    }
    Ok(Flow::Continue)
}
