// src/core/protocol/command_type.rs

//! The open catalogue of command kinds.
//!
//! Both peers agree on message identity purely through type names. The
//! control vocabulary every connection relies on is closed and lives in
//! [`Reserved`]; applications extend the catalogue at startup with
//! [`CommandType::define`]. The registry is process-wide and append-only.

use crate::core::SessionError;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumCount, EnumIter, EnumString, IntoStaticStr};

/// The control commands understood by every session, in definition order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
pub enum Reserved {
    #[strum(serialize = "CL_CONNECT")]
    ClConnect,
    #[strum(serialize = "CL_RECONNECT")]
    ClReconnect,
    #[strum(serialize = "CL_DISCONNECT")]
    ClDisconnect,
    #[strum(serialize = "CL_UPDATE")]
    ClUpdate,
    #[strum(serialize = "CL_ERROR")]
    ClError,
    #[strum(serialize = "PING")]
    Ping,
    #[strum(serialize = "SVR_CONNECTED")]
    SvrConnected,
    #[strum(serialize = "SVR_DISCONNECT")]
    SvrDisconnect,
    #[strum(serialize = "SVR_EXECUTE_REMOTE")]
    SvrExecuteRemote,
    #[strum(serialize = "SVR_REMOTE_RESULT")]
    SvrRemoteResult,
    #[strum(serialize = "MESSAGE")]
    Message,
    #[strum(serialize = "PASSWORD")]
    Password,
}

impl Reserved {
    /// The wire name of this control command.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The registered `CommandType` for this control command.
    pub fn command_type(self) -> CommandType {
        // Reserved types are seeded when the registry is first touched.
        REGISTRY.read().by_name[self.name()].clone()
    }

    /// True for both directions of the disconnect notice.
    pub fn is_disconnect(self) -> bool {
        matches!(self, Reserved::ClDisconnect | Reserved::SvrDisconnect)
    }
}

/// An interned command kind: a unique name and its definition order.
#[derive(Clone)]
pub struct CommandType {
    name: Arc<str>,
    ordinal: usize,
}

impl CommandType {
    /// Defines a new command type. Each name may be defined exactly once per process.
    pub fn define(name: &str) -> Result<CommandType, SessionError> {
        if name.is_empty() {
            return Err(SessionError::InvalidState(
                "command type names cannot be empty".into(),
            ));
        }
        if name.len() > u16::MAX as usize {
            return Err(SessionError::FrameTooLarge(format!(
                "command type name of {} bytes",
                name.len()
            )));
        }
        REGISTRY.write().insert(name)
    }

    /// Looks up a previously defined command type by name.
    pub fn lookup(name: &str) -> Result<CommandType, SessionError> {
        REGISTRY
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownCommandType(name.to_string()))
    }

    /// Every defined command type, in definition order.
    pub fn all() -> Vec<CommandType> {
        REGISTRY.read().ordered.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The control command this type corresponds to, if it is reserved.
    pub fn reserved(&self) -> Option<Reserved> {
        if self.ordinal < Reserved::COUNT {
            self.name.parse().ok()
        } else {
            None
        }
    }
}

impl PartialEq for CommandType {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal == other.ordinal
    }
}

impl Eq for CommandType {}

impl std::hash::Hash for CommandType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ordinal.hash(state);
    }
}

impl PartialOrd for CommandType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommandType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordinal.cmp(&other.ordinal)
    }
}

impl fmt::Debug for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.ordinal)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<Reserved> for CommandType {
    fn from(r: Reserved) -> Self {
        r.command_type()
    }
}

struct CommandTypeRegistry {
    by_name: HashMap<Arc<str>, CommandType>,
    ordered: Vec<CommandType>,
}

impl CommandTypeRegistry {
    fn seeded() -> Self {
        let mut registry = Self {
            by_name: HashMap::new(),
            ordered: Vec::new(),
        };
        for reserved in Reserved::iter() {
            // Reserved names are distinct, so seeding cannot collide.
            let _ = registry.insert(reserved.name());
        }
        registry
    }

    fn insert(&mut self, name: &str) -> Result<CommandType, SessionError> {
        if self.by_name.contains_key(name) {
            return Err(SessionError::DuplicateCommandType(name.to_string()));
        }
        let command_type = CommandType {
            name: Arc::from(name),
            ordinal: self.ordered.len(),
        };
        self.by_name
            .insert(command_type.name.clone(), command_type.clone());
        self.ordered.push(command_type.clone());
        Ok(command_type)
    }
}

static REGISTRY: Lazy<RwLock<CommandTypeRegistry>> =
    Lazy::new(|| RwLock::new(CommandTypeRegistry::seeded()));
