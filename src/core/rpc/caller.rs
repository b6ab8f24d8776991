// src/core/rpc/caller.rs

//! The calling side: issuing execute commands and waiting for their results.

use super::serializer::ObjectSerializer;
use super::value::RpcValue;
use super::{KEY_CANCELLED, KEY_ERROR, KEY_METHOD, KEY_NUM_ARGS, KEY_RESPONSE_ID, KEY_RETURNS, KEY_TARGET, arg_key};
use crate::core::protocol::{ArgValue, Command, Reserved};
use crate::core::session::SessionCore;
use crate::core::{SessionError, metrics};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a remote call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    /// The callee returned a value (`Null` for methods without one).
    Returned(RpcValue),
    /// The callee raised its cancel flag.
    Cancelled,
    /// The session closed before a response arrived.
    Disconnected,
    /// No result was requested; the call was only queued.
    Dispatched,
}

impl RpcOutcome {
    /// The returned value, if there is one.
    pub fn value(self) -> Option<RpcValue> {
        match self {
            RpcOutcome::Returned(value) => Some(value),
            _ => None,
        }
    }
}

pub(crate) enum Response {
    Returned(RpcValue),
    Cancelled,
    Failed(String),
}

/// Remote calls issued from one session that are still waiting for a result.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<String, oneshot::Sender<Response>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn register(&self, id: String) -> (PendingGuard<'_>, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id.clone(), tx);
        (PendingGuard { calls: self, id }, rx)
    }

    /// Completes the call a result command answers.
    ///
    /// Returns the command unchanged when no pending call claims it.
    pub(crate) fn resolve(
        &self,
        serializer: &dyn ObjectSerializer,
        command: Command,
    ) -> Option<Command> {
        let Some(id) = command.get_str(KEY_RESPONSE_ID) else {
            return Some(command);
        };
        let Some((_, tx)) = self.calls.remove(&id) else {
            return Some(command);
        };

        let response = if command.get_bool_or(KEY_CANCELLED, false) {
            Response::Cancelled
        } else if let Some(error) = command.get_str(KEY_ERROR) {
            Response::Failed(error)
        } else {
            match command.get_str(KEY_RETURNS) {
                None => Response::Returned(RpcValue::Null),
                Some(encoded) => match serializer.deserialize(&encoded) {
                    Ok(value) => Response::Returned(value),
                    Err(e) => Response::Failed(format!("undecodable result: {e}")),
                },
            }
        };
        if tx.send(response).is_err() {
            debug!("Result for '{id}' arrived after the caller gave up.");
        }
        None
    }

    /// Wakes every waiter with a disconnect.
    pub(crate) fn fail_all(&self) {
        // Dropping the senders resolves the receivers with an error.
        self.calls.clear();
    }
}

// Removes the pending entry on every exit path of `invoke`, including the
// caller dropping the future.
struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.calls.remove(&self.id);
    }
}

/// Builds the execute command for a call.
pub(crate) fn execute_command(
    serializer: &dyn ObjectSerializer,
    target: &str,
    method: &str,
    args: &[RpcValue],
) -> Result<Command, SessionError> {
    let mut command = Command::new(Reserved::SvrExecuteRemote)
        .with(KEY_METHOD, method)
        .with(KEY_TARGET, target)
        .with(KEY_NUM_ARGS, args.len());
    for (index, arg) in args.iter().enumerate() {
        command.put(arg_key(index), ArgValue::Structured(serializer.serialize(arg)?));
    }
    Ok(command)
}

pub(crate) async fn invoke(
    session: &SessionCore,
    target: &str,
    method: &str,
    expects_result: bool,
    args: Vec<RpcValue>,
) -> Result<RpcOutcome, SessionError> {
    if !session.is_connected() {
        warn!(
            "Session '{}': cannot invoke {target}.{method}, not connected.",
            session.name()
        );
        return Err(SessionError::NotConnected);
    }

    let mut command = execute_command(session.serializer().as_ref(), target, method, &args)?;
    metrics::RPC_CALLS_TOTAL.inc();
    if !expects_result {
        session.send(command)?;
        return Ok(RpcOutcome::Dispatched);
    }

    let id = format!("{method}@{target}#{}", Uuid::new_v4().simple());
    command.put(KEY_RESPONSE_ID, id.as_str());
    let (_guard, rx) = session.pending_calls().register(id.clone());
    let timer = metrics::RPC_LATENCY_SECONDS.start_timer();
    session.send(command)?;

    // Teardown leaves the connected state before it fails pending calls, so a
    // call registered too late to be failed is caught here.
    if !session.is_connected() {
        timer.stop_and_discard();
        return Ok(RpcOutcome::Disconnected);
    }

    match rx.await {
        Ok(Response::Returned(value)) => {
            timer.observe_duration();
            Ok(RpcOutcome::Returned(value))
        }
        Ok(Response::Cancelled) => {
            timer.observe_duration();
            session.listeners().notify_cancelled(session, &id);
            Ok(RpcOutcome::Cancelled)
        }
        Ok(Response::Failed(message)) => {
            timer.observe_duration();
            Err(SessionError::Rpc(message))
        }
        Err(_) => {
            timer.stop_and_discard();
            debug!("Remote call '{id}' ended by disconnect.");
            Ok(RpcOutcome::Disconnected)
        }
    }
}
