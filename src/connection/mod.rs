// src/connection/mod.rs

//! Manages the server's side of a client session: the handshake that admits
//! a socket, and the `Connection` object that survives link loss.

// Declare the private sub-modules of the `connection` module.
mod guard;
pub(crate) mod handshake;
mod session;

pub use handshake::{ExactVersion, Rejection, VersionPolicy};
pub use session::Connection;
