// src/connection/handshake.rs

//! The server side of the connection handshake.
//!
//! Runs once per accepted socket, on its own task:
//! magic number, `CL_CONNECT`/`CL_RECONNECT`, version check, optional
//! password exchange, then resolution against the session registry.

use super::guard::AdmissionGuard;
use crate::core::metrics;
use crate::core::protocol::{Command, CommandCodec, HANDSHAKE_MAGIC, Reserved};
use crate::core::SessionError;
use crate::server::ServerContext;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

// How long a rejected peer is given to receive the rejection notice.
const REJECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Decides whether a client version may talk to this server.
pub trait VersionPolicy: Send + Sync + 'static {
    fn is_compatible(&self, server_version: &str, client_version: &str) -> bool;
}

/// The default policy: versions must match exactly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactVersion;

impl VersionPolicy for ExactVersion {
    fn is_compatible(&self, server_version: &str, client_version: &str) -> bool {
        server_version == client_version
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    UnknownClient,
    BadHello(String),
    Version(String),
    Password,
    Banned(String),
    Duplicate(String),
    Capacity,
    ResumeToken(String),
    Timeout,
    Transport(SessionError),
}

impl Rejection {
    /// The metrics label for this rejection.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::UnknownClient => "unknown_client",
            Rejection::BadHello(_) => "bad_hello",
            Rejection::Version(_) => "version",
            Rejection::Password => "password",
            Rejection::Banned(_) => "banned",
            Rejection::Duplicate(_) => "duplicate",
            Rejection::Capacity => "capacity",
            Rejection::ResumeToken(_) => "resume_token",
            Rejection::Timeout => "timeout",
            Rejection::Transport(_) => "transport",
        }
    }

    /// The message sent to the rejected peer.
    pub fn message(&self) -> String {
        match self {
            Rejection::UnknownClient => "Unknown client".to_string(),
            Rejection::BadHello(reason) => reason.clone(),
            Rejection::Version(version) => format!("Incompatible client version '{version}'"),
            Rejection::Password => "Invalid password".to_string(),
            Rejection::Banned(name) => format!("'{name}' is banned"),
            Rejection::Duplicate(name) => format!("'{name}' is already connected"),
            Rejection::Capacity => "Max connections reached".to_string(),
            Rejection::ResumeToken(name) => format!("Invalid resume token for '{name}'"),
            Rejection::Timeout => "Handshake timed out".to_string(),
            Rejection::Transport(e) => e.to_string(),
        }
    }
}

impl From<Rejection> for SessionError {
    fn from(rejection: Rejection) -> Self {
        SessionError::Protocol(rejection.message())
    }
}

impl From<SessionError> for Rejection {
    fn from(e: SessionError) -> Self {
        Rejection::Transport(e)
    }
}

/// The outcome of resolving a handshake against the registry.
pub(crate) enum Resolution {
    New(Arc<super::Connection>),
    Resumed(Arc<super::Connection>),
}

/// Runs the handshake for one accepted socket and, on success, activates the session.
pub(crate) async fn run<T>(ctx: Arc<ServerContext>, mut io: T, addr: SocketAddr)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let deadline = Instant::now() + ctx.config.handshake_timeout;

    let magic = match timeout_at(deadline, io.read_u64()).await {
        Ok(Ok(magic)) => magic,
        Ok(Err(e)) => {
            debug!("Connection from {addr} closed before the handshake: {e}");
            return;
        }
        Err(_) => {
            record_rejection(addr, &Rejection::Timeout);
            return;
        }
    };
    if magic != HANDSHAKE_MAGIC {
        // Not our protocol; nothing it could parse is worth sending.
        debug!("Bad magic {magic:#018x} from {addr}.");
        record_rejection(addr, &Rejection::UnknownClient);
        return;
    }

    let mut framed = Framed::new(io, CommandCodec::new(ctx.config.codec));
    let outcome = match timeout_at(deadline, negotiate(&ctx, &mut framed)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Rejection::Timeout),
    };

    match outcome {
        Ok((hello, resolution)) => {
            let guard = match resolution {
                Resolution::New(c) => AdmissionGuard::new(ctx.clone(), c, false),
                Resolution::Resumed(c) => AdmissionGuard::new(ctx.clone(), c, true),
            };
            let connection = guard.connection().clone();
            connection.absorb_hello(&hello, addr);
            match connection.activate(framed, guard.resumed()) {
                Ok(()) => guard.commit(),
                Err(e) => warn!("Failed to activate session '{}': {e}", connection.name()),
            }
        }
        Err(rejection) => {
            record_rejection(addr, &rejection);
            reject(&mut framed, &rejection).await;
        }
    }
}

fn record_rejection(addr: SocketAddr, rejection: &Rejection) {
    metrics::HANDSHAKE_FAILURES_TOTAL
        .with_label_values(&[rejection.label()])
        .inc();
    info!("Rejected connection from {addr}: {}", rejection.message());
}

/// Best-effort delivery of the rejection reason before the socket closes.
async fn reject<T>(framed: &mut Framed<T, CommandCodec>, rejection: &Rejection)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    // A broken socket cannot carry the notice; a bad frame still can.
    if matches!(rejection, Rejection::Transport(SessionError::Io(_))) {
        return;
    }
    let notice = Command::new(Reserved::SvrDisconnect).with("message", rejection.message());
    let delivery = async {
        framed.send(notice).await?;
        framed.close().await
    };
    if let Err(e) = timeout(REJECTION_TIMEOUT, delivery)
        .await
        .unwrap_or_else(|e| Err(e.into()))
    {
        debug!("Could not deliver rejection notice: {e}");
    }
}

async fn next_command<T>(framed: &mut Framed<T, CommandCodec>) -> Result<Command, Rejection>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(command)) => Ok(command),
        Some(Err(e)) => Err(Rejection::Transport(e)),
        None => Err(Rejection::Transport(SessionError::Io(Arc::new(
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ),
        )))),
    }
}

async fn negotiate<T>(
    ctx: &Arc<ServerContext>,
    framed: &mut Framed<T, CommandCodec>,
) -> Result<(Command, Resolution), Rejection>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = next_command(framed).await?;
    if !matches!(
        hello.reserved(),
        Some(Reserved::ClConnect | Reserved::ClReconnect)
    ) {
        return Err(Rejection::BadHello(format!(
            "Expected CL_CONNECT but received '{}'",
            hello.name()
        )));
    }

    let name = hello
        .get_str("name")
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| Rejection::BadHello("Missing client name".to_string()))?;
    let version = hello
        .get_str("version")
        .ok_or_else(|| Rejection::BadHello("Missing client version".to_string()))?;
    debug!("Handshake from '{name}' (version {version}).");

    let policy = ctx.version_policy.read().clone();
    if !policy.is_compatible(&ctx.config.version, &version) {
        return Err(Rejection::Version(version));
    }

    if let Some(expected) = &ctx.config.password {
        let offered = match hello.get_str("password") {
            Some(password) => password,
            None => {
                framed.send(Command::new(Reserved::Password)).await?;
                let reply = next_command(framed).await?;
                if !reply.is(Reserved::Password) {
                    return Err(Rejection::BadHello(format!(
                        "Expected PASSWORD but received '{}'",
                        reply.name()
                    )));
                }
                reply.get_str("password").unwrap_or_default()
            }
        };
        if offered != *expected {
            return Err(Rejection::Password);
        }
    }

    if ctx.banned.read().contains(&name) {
        return Err(Rejection::Banned(name));
    }

    let token = hello.get_str("resumeToken");
    let resolution = ctx.registry.resolve(ctx, &name, token.as_deref())?;
    Ok((hello, resolution))
}
