// src/core/rpc/mod.rs

//! Remote method invocation over a session's command channel.
//!
//! A call travels as `SVR_EXECUTE_REMOTE` and, when the caller wants a result,
//! comes back as `SVR_REMOTE_RESULT` carrying the same `responseId`.

pub mod callee;
pub mod caller;
pub mod registry;
pub mod serializer;
pub mod value;

pub use caller::{PendingCalls, RpcOutcome};
pub use registry::{CallContext, MethodHandler, RemoteObject, RemoteRegistry, Reply, TypeHierarchy};
pub use serializer::{JsonSerializer, ObjectSerializer};
pub use value::{ParamKind, RpcArgs, RpcValue};

// Argument keys of the execute and result commands.
pub const KEY_METHOD: &str = "method";
pub const KEY_TARGET: &str = "target";
pub const KEY_NUM_ARGS: &str = "numArgs";
pub const KEY_RESPONSE_ID: &str = "responseId";
pub const KEY_RETURNS: &str = "returns";
pub const KEY_CANCELLED: &str = "cancelled";
pub const KEY_ERROR: &str = "error";

/// The key of the `index`th argument of an execute command.
pub fn arg_key(index: usize) -> String {
    format!("arg{index}")
}
