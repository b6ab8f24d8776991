// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use questlink::config::{ClientConfig, Config};
use questlink::core::SessionError;
use questlink::core::protocol::{CodecKind, Command, CommandCodec, HANDSHAKE_MAGIC, Reserved};
use questlink::core::session::{SessionCore, SessionListener};
use questlink::{ClientSession, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    // Ignore the error if another test already installed a subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
}

/// A server configuration bound to an ephemeral local port.
pub fn server_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        handshake_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// A running server plus the helpers tests use against it.
pub struct TestServer {
    pub server: Server,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(server_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        init_tracing();
        let server = Server::bind(config).await.expect("Failed to bind test server");
        server.start().expect("Failed to start test server");
        Self { server }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// A client configuration pointing at this server.
    pub fn client_config(&self, name: &str) -> ClientConfig {
        client_config_for(self.addr(), name)
    }

    pub fn client(&self, name: &str) -> ClientSession {
        ClientSession::new(self.client_config(name))
    }

    /// Connects a client and waits until the server has registered it.
    pub async fn connect(&self, name: &str) -> ClientSession {
        let client = self.client(name);
        client.connect().await.expect("connect failed");
        let server = self.server.clone();
        let owned = name.to_string();
        assert!(
            eventually(move || server.connection(&owned).is_some_and(|c| c.is_connected())).await,
            "server never registered '{name}'"
        );
        client
    }

    pub async fn raw_peer(&self) -> RawPeer {
        RawPeer::connect(self.addr(), self.server.config().codec).await
    }
}

pub fn client_config_for(addr: SocketAddr, name: &str) -> ClientConfig {
    let mut config = ClientConfig::new(name);
    config.host = addr.ip().to_string();
    config.port = addr.port();
    config.connect_timeout = WAIT;
    config
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Speaks the wire protocol directly, for handshake-level tests.
pub struct RawPeer {
    pub framed: Framed<TcpStream, CommandCodec>,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr, codec: CodecKind) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_u64(HANDSHAKE_MAGIC).await.unwrap();
        Self {
            framed: Framed::new(stream, CommandCodec::new(codec)),
        }
    }

    pub async fn send(&mut self, command: Command) {
        self.framed.send(command).await.unwrap();
    }

    /// The next command, or `None` once the server closed the link.
    pub async fn recv(&mut self) -> Option<Command> {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Ok(Some(Ok(command))) => Some(command),
            Ok(Some(Err(e))) => panic!("decode error: {e}"),
            Ok(None) => None,
            Err(_) => panic!("timed out waiting for a command"),
        }
    }

    /// The next command that is not a keep-alive ping.
    pub async fn recv_skipping_pings(&mut self) -> Option<Command> {
        loop {
            let command = self.recv().await?;
            if !command.is(Reserved::Ping) {
                return Some(command);
            }
        }
    }

    pub async fn hello(&mut self, name: &str, version: &str) -> Option<Command> {
        self.send(
            Command::new(Reserved::ClConnect)
                .with("name", name)
                .with("version", version),
        )
        .await;
        self.recv().await
    }
}

/// A TCP forwarder whose links can be cut, simulating a network failure.
pub struct Proxy {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Proxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));
        let accept_links = links.clone();
        let accept = tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                accept_links.lock().push(link);
            }
        });
        Self {
            addr,
            links,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drops every forwarded connection. Both ends see the socket close.
    pub fn sever(&self) {
        for link in self.links.lock().drain(..) {
            link.abort();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.sever();
    }
}

/// Records what a session listener observes.
#[derive(Default)]
pub struct EventLog {
    pub commands: Mutex<Vec<Command>>,
    pub events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn has_event(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().len()
    }
}

impl SessionListener for EventLog {
    fn on_command(&self, _session: &SessionCore, command: &Command) {
        self.commands.lock().push(command.clone());
    }

    fn on_disconnected(&self, _session: &SessionCore, reason: &str) {
        self.events.lock().push(format!("disconnected:{reason}"));
    }

    fn on_reconnected(&self, _session: &SessionCore) {
        self.events.lock().push("reconnected".to_string());
    }

    fn on_property_changed(
        &self,
        _session: &SessionCore,
        key: &str,
        _old: Option<&questlink::core::ArgValue>,
        new: &questlink::core::ArgValue,
    ) {
        self.events.lock().push(format!("property:{key}={new}"));
    }

    fn on_cancelled(&self, _session: &SessionCore, _response_id: &str) {
        self.events.lock().push("cancelled".to_string());
    }

    fn on_timeout(&self, _session: &SessionCore) {
        self.events.lock().push("timeout".to_string());
    }
}

/// Maps a client error to the server's rejection message.
pub fn rejection_message(result: Result<(), SessionError>) -> String {
    match result {
        Err(SessionError::Protocol(message)) => message,
        other => panic!("expected a rejection, got {other:?}"),
    }
}
