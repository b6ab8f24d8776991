// src/core/mod.rs

//! The protocol machinery shared by servers and clients: commands and their
//! codec, sessions, and remote calls.

pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod rpc;
pub mod session;

pub use errors::{ErrorKind, SessionError};
pub use protocol::{ArgValue, Command, CommandType, Reserved};
pub use session::{ConnectionState, SessionCore};
