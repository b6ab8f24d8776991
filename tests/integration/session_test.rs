// tests/integration/session_test.rs

//! Integration tests for connected sessions
//! Tests: command delivery, property updates, keep-alive, disconnects, kicks, shutdown

use super::test_helpers::{EventLog, TestServer, eventually, server_config};
use parking_lot::Mutex;
use questlink::connection::Connection;
use questlink::core::{ArgValue, SessionError};
use questlink::core::protocol::{Command, Reserved};
use questlink::core::session::{ConnectionState, TIMED_OUT};
use questlink::server::{SHUTDOWN_NOTICE, ServerListener};
use questlink::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn numbered(n: i64) -> Command {
    Command::new(Reserved::Message).with("n", n)
}

// ===== Command Delivery =====

#[tokio::test]
async fn test_client_commands_arrive_in_order() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("alice").await;
    let log = Arc::new(EventLog::default());
    ctx.server
        .connection("alice")
        .unwrap()
        .session()
        .add_listener(log.clone());

    for n in 0..50 {
        client.send(numbered(n)).unwrap();
    }
    let watched = log.clone();
    assert!(eventually(move || watched.command_count() == 50).await);
    let received: Vec<i64> = log
        .commands
        .lock()
        .iter()
        .map(|c| c.get_i64("n").unwrap())
        .collect();
    assert_eq!(received, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_server_sends_and_broadcasts() {
    let ctx = TestServer::new().await;
    let alice = ctx.connect("alice").await;
    let bob = ctx.connect("bob").await;
    let alice_log = Arc::new(EventLog::default());
    let bob_log = Arc::new(EventLog::default());
    alice.add_listener(alice_log.clone());
    bob.add_listener(bob_log.clone());

    ctx.server
        .send_to("alice", Command::new(Reserved::Message).with("text", "just you"))
        .unwrap();
    assert_eq!(
        ctx.server
            .broadcast(Command::new(Reserved::Message).with("text", "everyone")),
        2
    );
    assert_eq!(
        ctx.server.broadcast_except(
            Command::new(Reserved::Message).with("text", "not alice"),
            "alice"
        ),
        1
    );
    assert!(ctx.server.send_to("nobody", numbered(0)).is_err());

    let (a, b) = (alice_log.clone(), bob_log.clone());
    assert!(eventually(move || a.command_count() == 2 && b.command_count() == 2).await);
    let texts = |log: &EventLog| -> Vec<String> {
        log.commands
            .lock()
            .iter()
            .filter_map(|c| c.get_str("text"))
            .collect()
    };
    assert_eq!(texts(&alice_log), vec!["just you", "everyone"]);
    assert_eq!(texts(&bob_log), vec!["everyone", "not alice"]);
}

#[tokio::test]
async fn test_send_while_disconnected_fails() {
    let ctx = TestServer::new().await;
    let client = ctx.client("carol");
    assert!(client.send(numbered(1)).is_err());

    client.connect().await.unwrap();
    client.disconnect().await;
    assert!(client.send(numbered(2)).is_err());
}

#[tokio::test]
async fn test_oversized_command_is_refused_without_closing_the_link() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("dora").await;
    let log = Arc::new(EventLog::default());
    ctx.server
        .connection("dora")
        .unwrap()
        .session()
        .add_listener(log.clone());

    let huge = "x".repeat(17 * 1024 * 1024);
    let err = assert_err!(client.send(Command::new(Reserved::Message).with("text", huge)));
    assert!(matches!(err, SessionError::FrameTooLarge(_)));

    let long_key = "k".repeat(70_000);
    let err = assert_err!(client.send(Command::new(Reserved::Message).with(long_key, 1)));
    assert!(matches!(err, SessionError::FrameTooLarge(_)));

    // The link is untouched and keeps carrying traffic.
    assert_ok!(client.send(numbered(7)));
    let watched = log.clone();
    assert!(eventually(move || watched.command_count() == 1).await);
    assert!(client.is_connected());
    assert_eq!(client.session().last_close_reason(), None);
}

// ===== Property Updates =====

#[tokio::test]
async fn test_property_update_reaches_server() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("dave").await;
    let connection = ctx.server.connection("dave").unwrap();
    let log = Arc::new(EventLog::default());
    connection.session().add_listener(log.clone());

    client.set_property("color", "red").unwrap();
    let watched = log.clone();
    assert!(eventually(move || watched.has_event("property:color=red")).await);
    assert_eq!(
        connection.session().attribute("color"),
        Some(ArgValue::Str("red".to_string()))
    );
    assert_eq!(
        client.session().attribute("color"),
        Some(ArgValue::Str("red".to_string()))
    );
}

#[tokio::test]
async fn test_offline_property_travels_with_handshake() {
    let ctx = TestServer::new().await;
    let client = ctx.client("erin");
    client.set_property("seat", 3).unwrap();
    client.connect().await.unwrap();

    let connection = ctx.server.connection("erin").unwrap();
    assert_eq!(
        connection
            .session()
            .attribute("seat")
            .and_then(|v| v.as_i64()),
        Some(3)
    );
}

// ===== Keep-Alive =====

#[tokio::test]
async fn test_idle_link_is_pinged() {
    let mut config = server_config();
    config.keep_alive = Duration::from_millis(100);
    let ctx = TestServer::with_config(config).await;
    let client = ctx.connect("frank").await;

    let session = client.session().clone();
    assert!(eventually(move || session.last_round_trip().is_some()).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.is_connected());
    assert!(ctx.server.connection("frank").unwrap().is_connected());
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let mut config = server_config();
    config.keep_alive = Duration::from_millis(100);
    let ctx = TestServer::with_config(config).await;
    let version = ctx.server.config().version.clone();

    let mut peer = ctx.raw_peer().await;
    let reply = peer.hello("grace", &version).await.unwrap();
    assert!(reply.is(Reserved::SvrConnected));
    let connection = ctx.server.connection("grace").unwrap();
    let log = Arc::new(EventLog::default());
    connection.session().add_listener(log.clone());

    // Read (and ignore) pings until the server gives up on us.
    while peer.recv().await.is_some() {}

    let watched = log.clone();
    assert!(eventually(move || watched.has_event(&format!("disconnected:{TIMED_OUT}"))).await);
    assert!(log.has_event("timeout"));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(
        connection.session().last_close_reason().as_deref(),
        Some(TIMED_OUT)
    );
    // Lost to a failure, so it is kept for a resume.
    assert!(ctx.server.connection("grace").is_some());
}

#[tokio::test]
async fn test_ping_is_echoed() {
    let ctx = TestServer::new().await;
    let version = ctx.server.config().version.clone();
    let mut peer = ctx.raw_peer().await;
    peer.hello("heidi", &version).await.unwrap();

    peer.send(Command::new(Reserved::Ping).with("sent", 1234i64))
        .await;
    let pong = peer.recv().await.unwrap();
    assert!(pong.is(Reserved::Ping));
    assert_eq!(pong.get_i64("sent").unwrap(), 1234);
    assert!(pong.get_bool("pong").unwrap());
}

// ===== Disconnects =====

#[derive(Default)]
struct Departures {
    seen: Mutex<Vec<(String, String)>>,
    arrivals: Mutex<Vec<String>>,
}

impl ServerListener for Departures {
    fn on_connected(&self, _server: &Server, connection: &Arc<Connection>) {
        self.arrivals.lock().push(connection.name().to_string());
    }

    fn on_disconnected(&self, _server: &Server, connection: &Arc<Connection>, reason: &str) {
        self.seen
            .lock()
            .push((connection.name().to_string(), reason.to_string()));
    }
}

struct Broken;

impl ServerListener for Broken {
    fn on_connected(&self, _server: &Server, _connection: &Arc<Connection>) {
        panic!("listener bug");
    }
}

#[tokio::test]
async fn test_client_disconnect_frees_the_name() {
    let ctx = TestServer::new().await;
    let departures = Arc::new(Departures::default());
    ctx.server.add_listener(Arc::new(Broken));
    ctx.server.add_listener(departures.clone());

    let client = ctx.connect("ivan").await;
    let watched = departures.clone();
    assert!(eventually(move || watched.arrivals.lock().len() == 1).await);
    assert_eq!(departures.arrivals.lock()[0], "ivan");
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let watched = departures.clone();
    assert!(eventually(move || watched.seen.lock().len() == 1).await);
    assert_eq!(departures.seen.lock()[0].0, "ivan");
    assert!(ctx.server.connection("ivan").is_none());

    // A different client may now use the name.
    let again = ctx.connect("ivan").await;
    assert!(again.is_connected());
}

#[tokio::test]
async fn test_disconnect_notice_reaches_server() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("judy").await;
    let connection = ctx.server.connection("judy").unwrap();
    let log = Arc::new(EventLog::default());
    connection.session().add_listener(log.clone());

    client.disconnect().await;
    let watched = log.clone();
    assert!(eventually(move || watched.has_event("disconnected:")).await);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_kick() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("ken").await;
    let log = Arc::new(EventLog::default());
    client.add_listener(log.clone());

    assert!(ctx.server.kick("ken", "Be nice").await);
    assert!(!ctx.server.kick("nobody", "Be nice").await);
    assert!(ctx.server.connection("ken").is_none());

    let watched = log.clone();
    assert!(eventually(move || watched.has_event("disconnected:Be nice")).await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.session().last_close_reason().as_deref(), Some("Be nice"));
}

#[tokio::test]
async fn test_ban_kicks_and_refuses() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("leo").await;

    ctx.server.ban("leo").await;
    let session = client.session().clone();
    assert!(eventually(move || session.state() == ConnectionState::Disconnected).await);
    assert_eq!(
        client.session().last_close_reason().as_deref(),
        Some("'leo' is banned")
    );
    assert!(client.connect().await.is_err());
}

#[tokio::test]
async fn test_stop_disconnects_everyone() {
    let ctx = TestServer::new().await;
    let alice = ctx.connect("alice").await;
    let bob = ctx.connect("bob").await;
    assert!(ctx.server.is_running());

    ctx.server.stop().await;
    assert!(!ctx.server.is_running());
    assert_eq!(ctx.server.connections().len(), 0);

    for client in [&alice, &bob] {
        let session = client.session().clone();
        assert!(eventually(move || session.state() == ConnectionState::Disconnected).await);
        assert_eq!(
            client.session().last_close_reason().as_deref(),
            Some(SHUTDOWN_NOTICE)
        );
    }
    assert!(ctx.server.start().is_err());
}

#[tokio::test]
async fn test_stop_before_start() {
    let server = Server::bind(server_config()).await.unwrap();
    assert!(!server.is_running());
    server.stop().await;
    assert!(server.start().is_err());
}
