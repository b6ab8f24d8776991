// src/core/rpc/registry.rs

//! Explicit registration of objects that can be called remotely.
//!
//! An application builds a [`RemoteObject`] per target, lists its methods
//! with their parameter kinds and handlers, and registers it under an id.
//! The registry only keeps weak references; the application owns the objects.

use super::value::{ParamKind, RpcArgs, RpcValue};
use crate::core::SessionError;
use crate::core::session::listener::panic_message;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

/// A remote method implementation.
pub type MethodHandler =
    Arc<dyn Fn(&CallContext, RpcArgs) -> Result<RpcValue, String> + Send + Sync>;

struct RemoteMethod {
    name: String,
    params: Vec<ParamKind>,
    handler: MethodHandler,
}

impl RemoteMethod {
    fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ParamKind::signature_name).collect();
        format!("{}({})", self.name, params.join(","))
    }
}

/// What a completed invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Returned(RpcValue),
    /// The cancel flag was raised while the method ran.
    Cancelled,
}

/// A callable target: a class name plus a table of methods.
pub struct RemoteObject {
    class: String,
    methods: Vec<RemoteMethod>,
    // Declared signature -> method index.
    exact: HashMap<String, usize>,
    // Call signatures already resolved by the compatibility scan.
    resolved: RwLock<HashMap<String, usize>>,
    cancelled: AtomicBool,
}

impl RemoteObject {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            methods: Vec::new(),
            exact: HashMap::new(),
            resolved: RwLock::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Adds a method. A later method with an identical signature shadows an earlier one.
    pub fn method<F>(mut self, name: &str, params: Vec<ParamKind>, handler: F) -> Self
    where
        F: Fn(&CallContext, RpcArgs) -> Result<RpcValue, String> + Send + Sync + 'static,
    {
        let method = RemoteMethod {
            name: name.to_string(),
            params,
            handler: Arc::new(handler),
        };
        self.exact.insert(method.signature(), self.methods.len());
        self.methods.push(method);
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Every declared signature, e.g. `sum(int,int)`.
    pub fn signatures(&self) -> Vec<String> {
        self.methods.iter().map(RemoteMethod::signature).collect()
    }

    /// Raises the object's one-shot cancel flag. Whichever invocation on this
    /// object completes next, fire-and-forget calls included, consumes it and
    /// reports cancellation instead of its value. Use [`CallContext::cancel`]
    /// to cancel one particular call.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn take_cancelled(&self) -> bool {
        self.cancelled.swap(false, Ordering::SeqCst)
    }

    fn resolve(
        &self,
        name: &str,
        args: &[RpcValue],
        types: &TypeHierarchy,
    ) -> Result<&RemoteMethod, SessionError> {
        let signature = call_signature(name, args);
        if let Some(&index) = self.exact.get(&signature) {
            return Ok(&self.methods[index]);
        }
        if let Some(&index) = self.resolved.read().get(&signature) {
            return Ok(&self.methods[index]);
        }

        let found = self.methods.iter().position(|m| {
            m.name == name
                && m.params.len() == args.len()
                && m.params
                    .iter()
                    .zip(args)
                    .all(|(param, arg)| accepts(param, arg, types))
        });
        match found {
            Some(index) => {
                self.resolved.write().insert(signature, index);
                Ok(&self.methods[index])
            }
            None => Err(SessionError::Rpc(format!(
                "no matching method {signature} on {}",
                self.class
            ))),
        }
    }

    /// Resolves `method` against `args` and runs it on the calling thread.
    pub(crate) fn invoke(
        self: &Arc<Self>,
        target: &str,
        method: &str,
        args: Vec<RpcValue>,
        types: &TypeHierarchy,
        interrupt: CancellationToken,
    ) -> Result<Reply, SessionError> {
        let resolved = self.resolve(method, &args, types)?;
        let args = args
            .into_iter()
            .zip(&resolved.params)
            .map(|(arg, kind)| arg.coerce(kind))
            .collect();
        let ctx = CallContext {
            target: target.to_string(),
            method: method.to_string(),
            cancelled: AtomicBool::new(false),
            interrupt,
        };

        let handler = resolved.handler.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&ctx, RpcArgs::new(args))));
        let cancelled = ctx.cancelled.load(Ordering::SeqCst) | self.take_cancelled();
        match outcome {
            Ok(_) if cancelled => Ok(Reply::Cancelled),
            Ok(Ok(value)) => Ok(Reply::Returned(value)),
            Ok(Err(message)) => Err(SessionError::Rpc(message)),
            Err(payload) => Err(SessionError::Rpc(format!(
                "{method} panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

/// Passed to every handler invocation.
pub struct CallContext {
    target: String,
    method: String,
    cancelled: AtomicBool,
    interrupt: CancellationToken,
}

impl CallContext {
    /// The id the target was registered under.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Marks this call as cancelled; the caller receives a cancellation
    /// instead of the handler's return value. Other calls running on the
    /// same object are not affected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once the session that issued the call has gone away.
    /// Long-running handlers should poll this and give up early.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }
}

type Matcher = fn(&ParamKind, &RpcValue, &TypeHierarchy) -> bool;

// Tried in order for every argument; the first that accepts wins.
const MATCHERS: [Matcher; 5] = [
    exact_kind,
    primitive_widening,
    object_subtype,
    null_to_reference,
    any_value,
];

fn accepts(param: &ParamKind, arg: &RpcValue, types: &TypeHierarchy) -> bool {
    MATCHERS.iter().any(|matcher| matcher(param, arg, types))
}

fn exact_kind(param: &ParamKind, arg: &RpcValue, _: &TypeHierarchy) -> bool {
    arg.kind().as_ref() == Some(param)
}

fn primitive_widening(param: &ParamKind, arg: &RpcValue, _: &TypeHierarchy) -> bool {
    arg.kind().is_some_and(|kind| param.widens_from(&kind))
}

fn object_subtype(param: &ParamKind, arg: &RpcValue, types: &TypeHierarchy) -> bool {
    match (param, arg) {
        (ParamKind::Object(expected), RpcValue::Object { class, .. }) => {
            types.is_subtype(class, expected)
        }
        _ => false,
    }
}

fn null_to_reference(param: &ParamKind, arg: &RpcValue, _: &TypeHierarchy) -> bool {
    arg.is_null() && param.is_reference()
}

fn any_value(param: &ParamKind, _: &RpcValue, _: &TypeHierarchy) -> bool {
    *param == ParamKind::Any
}

fn call_signature(name: &str, args: &[RpcValue]) -> String {
    let kinds: Vec<String> = args
        .iter()
        .map(|arg| {
            arg.kind()
                .map_or_else(|| "null".to_string(), |kind| kind.signature_name())
        })
        .collect();
    format!("{name}({})", kinds.join(","))
}

/// Declared class relationships used by the subtype matcher.
#[derive(Default)]
pub struct TypeHierarchy {
    parents: RwLock<HashMap<String, HashSet<String>>>,
}

impl TypeHierarchy {
    pub fn declare_subtype(&self, child: &str, parent: &str) {
        self.parents
            .write()
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    /// Reflexive and transitive.
    pub fn is_subtype(&self, child: &str, ancestor: &str) -> bool {
        if child == ancestor {
            return true;
        }
        let parents = self.parents.read();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([child]);
        while let Some(class) = queue.pop_front() {
            let Some(direct) = parents.get(class) else {
                continue;
            };
            for parent in direct {
                if parent == ancestor {
                    return true;
                }
                if seen.insert(parent.as_str()) {
                    queue.push_back(parent.as_str());
                }
            }
        }
        false
    }
}

/// Maps target ids to the objects registered under them.
#[derive(Default)]
pub struct RemoteRegistry {
    objects: DashMap<String, Weak<RemoteObject>>,
    types: TypeHierarchy,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `object` under `id`, replacing any previous registration.
    /// Returns true if an id was replaced.
    pub fn register(&self, id: &str, object: &Arc<RemoteObject>) -> bool {
        self.objects
            .insert(id.to_string(), Arc::downgrade(object))
            .is_some_and(|old| old.strong_count() > 0)
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.objects.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Result<Arc<RemoteObject>, SessionError> {
        let upgraded = self.objects.get(id).and_then(|weak| weak.upgrade());
        match upgraded {
            Some(object) => Ok(object),
            None => {
                // The owner dropped it without unregistering.
                self.objects.remove_if(id, |_, weak| weak.strong_count() == 0);
                Err(SessionError::Rpc(format!("unknown object id '{id}'")))
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_ok()
    }

    pub fn declare_subtype(&self, child: &str, parent: &str) {
        self.types.declare_subtype(child, parent);
    }

    pub fn types(&self) -> &TypeHierarchy {
        &self.types
    }

    /// Looks up `target` and invokes `method` on the current thread.
    pub fn call(
        &self,
        target: &str,
        method: &str,
        args: Vec<RpcValue>,
        interrupt: CancellationToken,
    ) -> Result<Reply, SessionError> {
        let object = self.get(target)?;
        object.invoke(target, method, args, &self.types, interrupt)
    }
}
