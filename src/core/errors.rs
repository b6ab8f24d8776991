// src/core/errors.rs

//! Defines the primary error type for the session protocol.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, covering every failure the protocol layer can surface.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Unknown command type '{0}'")]
    UnknownCommandType(String),

    #[error("Command type '{0}' is already defined")]
    DuplicateCommandType(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {0}")]
    FrameTooLarge(String),

    #[error("Missing argument '{0}'")]
    MissingArgument(String),

    #[error("Invalid argument '{key}': {reason}")]
    InvalidArgument { key: String, reason: String },

    /// A handshake rejection. The message is what the rejected peer is told.
    #[error("{0}")]
    Protocol(String),

    #[error("Outbound queue is not running")]
    QueueNotRunning,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Remote call failed: {0}")]
    Rpc(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// The broad failure classes a `SessionError` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal to a connection attempt; reported to the rejected peer.
    HandshakeFailure,
    /// Unknown command types or malformed frames; fatal to the session.
    ProtocolCorruption,
    /// Socket-level failures; fatal to the session.
    TransientIo,
    /// Failures of a remote call; never tear the session down.
    RpcFailure,
    /// Enqueueing on a stopped queue.
    QueueMisuse,
    /// Calling an operation in a state that does not allow it.
    Usage,
    Internal,
}

impl SessionError {
    /// Maps the error onto its failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Protocol(_) => ErrorKind::HandshakeFailure,
            SessionError::UnknownCommandType(_)
            | SessionError::MalformedFrame(_)
            | SessionError::FrameTooLarge(_)
            | SessionError::IncompleteData => ErrorKind::ProtocolCorruption,
            SessionError::Io(_) | SessionError::Timeout(_) | SessionError::Tls(_) => {
                ErrorKind::TransientIo
            }
            SessionError::Rpc(_) | SessionError::Serialization(_) => ErrorKind::RpcFailure,
            SessionError::QueueNotRunning => ErrorKind::QueueMisuse,
            SessionError::NotConnected
            | SessionError::InvalidState(_)
            | SessionError::MissingArgument(_)
            | SessionError::InvalidArgument { .. }
            | SessionError::DuplicateCommandType(_) => ErrorKind::Usage,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for errors that simply mean the peer went away.
    pub fn is_normal_disconnect(&self) -> bool {
        matches!(self, SessionError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        ))
    }

    pub(crate) fn invalid_argument(key: &str, reason: impl Into<String>) -> Self {
        SessionError::InvalidArgument {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

// `std::io::Error` is not cloneable, so the Io variant shares it through an Arc.
impl Clone for SessionError {
    fn clone(&self) -> Self {
        match self {
            SessionError::Io(e) => SessionError::Io(Arc::clone(e)),
            SessionError::IncompleteData => SessionError::IncompleteData,
            SessionError::UnknownCommandType(s) => SessionError::UnknownCommandType(s.clone()),
            SessionError::DuplicateCommandType(s) => SessionError::DuplicateCommandType(s.clone()),
            SessionError::MalformedFrame(s) => SessionError::MalformedFrame(s.clone()),
            SessionError::FrameTooLarge(s) => SessionError::FrameTooLarge(s.clone()),
            SessionError::MissingArgument(s) => SessionError::MissingArgument(s.clone()),
            SessionError::InvalidArgument { key, reason } => SessionError::InvalidArgument {
                key: key.clone(),
                reason: reason.clone(),
            },
            SessionError::Protocol(s) => SessionError::Protocol(s.clone()),
            SessionError::QueueNotRunning => SessionError::QueueNotRunning,
            SessionError::NotConnected => SessionError::NotConnected,
            SessionError::InvalidState(s) => SessionError::InvalidState(s.clone()),
            SessionError::Rpc(s) => SessionError::Rpc(s.clone()),
            SessionError::Serialization(s) => SessionError::Serialization(s.clone()),
            SessionError::Timeout(s) => SessionError::Timeout(s.clone()),
            SessionError::Tls(s) => SessionError::Tls(s.clone()),
            SessionError::Internal(s) => SessionError::Internal(s.clone()),
        }
    }
}

impl PartialEq for SessionError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SessionError::Io(e1), SessionError::Io(e2)) => e1.to_string() == e2.to_string(),
            (SessionError::UnknownCommandType(s1), SessionError::UnknownCommandType(s2))
            | (SessionError::DuplicateCommandType(s1), SessionError::DuplicateCommandType(s2))
            | (SessionError::MalformedFrame(s1), SessionError::MalformedFrame(s2))
            | (SessionError::FrameTooLarge(s1), SessionError::FrameTooLarge(s2))
            | (SessionError::MissingArgument(s1), SessionError::MissingArgument(s2))
            | (SessionError::Protocol(s1), SessionError::Protocol(s2))
            | (SessionError::InvalidState(s1), SessionError::InvalidState(s2))
            | (SessionError::Rpc(s1), SessionError::Rpc(s2))
            | (SessionError::Serialization(s1), SessionError::Serialization(s2))
            | (SessionError::Timeout(s1), SessionError::Timeout(s2))
            | (SessionError::Tls(s1), SessionError::Tls(s2))
            | (SessionError::Internal(s1), SessionError::Internal(s2)) => s1 == s2,
            (
                SessionError::InvalidArgument { key: k1, reason: r1 },
                SessionError::InvalidArgument { key: k2, reason: r2 },
            ) => k1 == k2 && r1 == r2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for SessionError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        SessionError::MalformedFrame(format!("invalid UTF-8: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for SessionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SessionError::Timeout("operation deadline elapsed".into())
    }
}
