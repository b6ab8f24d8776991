// src/core/rpc/callee.rs

//! The receiving side: running execute commands against registered objects.

use super::registry::Reply;
use super::value::RpcValue;
use super::{KEY_CANCELLED, KEY_ERROR, KEY_METHOD, KEY_NUM_ARGS, KEY_RESPONSE_ID, KEY_RETURNS, KEY_TARGET, arg_key};
use crate::core::SessionError;
use crate::core::protocol::{ArgValue, Command, Reserved};
use crate::core::session::SessionCore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Call {
    target: String,
    method: String,
    args: Vec<RpcValue>,
}

fn parse_call(session: &SessionCore, command: &Command) -> Result<Call, SessionError> {
    let method = command.require_str(KEY_METHOD)?;
    let target = command.require_str(KEY_TARGET)?;
    let count = command.get_i32(KEY_NUM_ARGS)?;
    let count = usize::try_from(count)
        .map_err(|_| SessionError::invalid_argument(KEY_NUM_ARGS, "negative argument count"))?;

    let serializer = session.serializer();
    let args = (0..count)
        .map(|index| {
            let encoded = command.require_str(&arg_key(index))?;
            serializer.deserialize(&encoded)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Call {
        target,
        method,
        args,
    })
}

/// Handles an incoming execute command on the session's reader task.
///
/// Calls that expect a result run on a blocking worker so a slow handler
/// never stalls the reader; the worker is abandoned when `interrupt` fires.
pub(crate) fn handle_execute(
    session: &Arc<SessionCore>,
    command: Command,
    interrupt: &CancellationToken,
) {
    let response_id = command.get_str(KEY_RESPONSE_ID);
    let call = match parse_call(session, &command) {
        Ok(call) => call,
        Err(e) => {
            warn!("Session '{}': malformed remote call: {e}", session.name());
            if let Some(id) = response_id {
                respond(session, result_command(session, &id, Err(e)));
            }
            return;
        }
    };
    debug!(
        "Session '{}': executing {}.{} with {} argument(s)",
        session.name(),
        call.target,
        call.method,
        call.args.len()
    );

    let Some(id) = response_id else {
        let outcome = session.remote().call(
            &call.target,
            &call.method,
            call.args,
            interrupt.child_token(),
        );
        if let Err(e) = outcome {
            warn!(
                "Session '{}': remote call {}.{} failed: {e}",
                session.name(),
                call.target,
                call.method
            );
        }
        return;
    };

    let session = session.clone();
    let interrupt = interrupt.clone();
    tokio::spawn(async move {
        let remote = session.remote().clone();
        let worker_token = interrupt.child_token();
        let work = tokio::task::spawn_blocking(move || {
            remote.call(&call.target, &call.method, call.args, worker_token)
        });
        tokio::select! {
            _ = interrupt.cancelled() => {
                debug!("Remote call '{id}' interrupted: session closed.");
            }
            joined = work => {
                let outcome = joined
                    .unwrap_or_else(|e| Err(SessionError::Internal(format!("remote call worker failed: {e}"))));
                respond(&session, result_command(&session, &id, outcome));
            }
        }
    });
}

fn respond(session: &SessionCore, response: Command) {
    if let Err(e) = session.send(response) {
        debug!(
            "Session '{}': dropping remote call result: {e}",
            session.name()
        );
    }
}

fn result_command(
    session: &SessionCore,
    id: &str,
    outcome: Result<Reply, SessionError>,
) -> Command {
    let response = Command::new(Reserved::SvrRemoteResult).with(KEY_RESPONSE_ID, id);
    let encoded = outcome.and_then(|reply| match reply {
        Reply::Returned(value) => session.serializer().serialize(&value).map(Some),
        Reply::Cancelled => Ok(None),
    });
    let response = match encoded {
        Ok(Some(value)) => response.with(KEY_RETURNS, ArgValue::Structured(value)),
        Ok(None) => response.with(KEY_CANCELLED, true),
        Err(SessionError::Rpc(message)) => response.with(KEY_ERROR, message),
        Err(e) => response.with(KEY_ERROR, e.to_string()),
    };
    // A result too large for one frame is reported to the caller as an error.
    match response.validate() {
        Ok(()) => response,
        Err(e) => Command::new(Reserved::SvrRemoteResult)
            .with(KEY_RESPONSE_ID, id)
            .with(KEY_ERROR, e.to_string()),
    }
}
