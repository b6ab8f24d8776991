// tests/integration/reconnect_test.rs

//! Integration tests for session resumption after link loss
//! Tests: resume via token, wrong tokens, fresh connects, retention expiry, reset

use super::test_helpers::{
    EventLog, Proxy, RawPeer, TestServer, client_config_for, eventually, server_config,
};
use questlink::ClientSession;
use questlink::core::protocol::{Command, Reserved};
use questlink::core::session::ConnectionState;
use std::sync::Arc;
use std::time::Duration;

/// Connects a raw peer as `name` and returns it with the issued resume token.
async fn raw_session(ctx: &TestServer, name: &str) -> (RawPeer, String) {
    let version = ctx.server.config().version.clone();
    let mut peer = ctx.raw_peer().await;
    let reply = peer.hello(name, &version).await.unwrap();
    assert!(reply.is(Reserved::SvrConnected));
    let token = reply.require_str("resumeToken").unwrap();
    (peer, token)
}

async fn wait_until_retained(ctx: &TestServer, name: &str) {
    let server = ctx.server.clone();
    let name = name.to_string();
    assert!(
        eventually(move || {
            server
                .connection(&name)
                .is_some_and(|c| c.state() == ConnectionState::Disconnected)
        })
        .await
    );
}

fn reconnect(name: &str, version: &str, token: Option<&str>) -> Command {
    let mut command = Command::new(Reserved::ClReconnect)
        .with("name", name)
        .with("version", version);
    if let Some(token) = token {
        command.put("resumeToken", token);
    }
    command
}

#[tokio::test]
async fn test_client_resumes_after_link_failure() {
    let ctx = TestServer::new().await;
    let proxy = Proxy::start(ctx.addr()).await;
    let client = ClientSession::new(client_config_for(proxy.addr(), "alice"));
    client.connect().await.unwrap();

    let server = ctx.server.clone();
    assert!(eventually(move || server.connection("alice").is_some_and(|c| c.is_connected())).await);
    let original = ctx.server.connection("alice").unwrap();
    original.session().set_attribute("score", 42);
    let server_log = Arc::new(EventLog::default());
    let client_log = Arc::new(EventLog::default());
    original.session().add_listener(server_log.clone());
    client.add_listener(client_log.clone());

    proxy.sever();
    let watched = client_log.clone();
    assert!(eventually(move || watched.events.lock().iter().any(|e| e.starts_with("disconnected:"))).await);
    wait_until_retained(&ctx, "alice").await;
    let watched = server_log.clone();
    assert!(eventually(move || watched.events.lock().iter().any(|e| e.starts_with("disconnected:"))).await);

    client.connect().await.unwrap();
    assert!(client.is_connected());
    let resumed = ctx.server.connection("alice").unwrap();
    assert!(Arc::ptr_eq(&original, &resumed));
    assert_eq!(resumed.session().attribute("score").and_then(|v| v.as_i64()), Some(42));

    let (s, c) = (server_log.clone(), client_log.clone());
    assert!(eventually(move || s.has_event("reconnected") && c.has_event("reconnected")).await);

    // The resumed link carries traffic both ways.
    client.send(Command::new(Reserved::Message).with("text", "back")).unwrap();
    let watched = server_log.clone();
    assert!(eventually(move || watched.command_count() == 1).await);
    resumed.send(Command::new(Reserved::Message).with("text", "welcome")).unwrap();
    let watched = client_log.clone();
    assert!(eventually(move || watched.command_count() == 1).await);
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let ctx = TestServer::new().await;
    let version = ctx.server.config().version.clone();
    let (peer, token) = raw_session(&ctx, "bob").await;
    drop(peer);
    wait_until_retained(&ctx, "bob").await;

    let mut impostor = ctx.raw_peer().await;
    impostor.send(reconnect("bob", &version, Some("not-the-token"))).await;
    let reply = impostor.recv().await.unwrap();
    assert!(reply.is(Reserved::SvrDisconnect));
    assert_eq!(
        reply.get_str("message").as_deref(),
        Some("Invalid resume token for 'bob'")
    );

    let mut owner = ctx.raw_peer().await;
    owner.send(reconnect("bob", &version, Some(&token))).await;
    let reply = owner.recv().await.unwrap();
    assert!(reply.is(Reserved::SvrConnected));
    assert!(reply.get_bool("resumed").unwrap());
    assert_ne!(reply.require_str("resumeToken").unwrap(), token);
}

#[tokio::test]
async fn test_live_session_cannot_be_taken_over() {
    let ctx = TestServer::new().await;
    let version = ctx.server.config().version.clone();
    let (_peer, token) = raw_session(&ctx, "carol").await;

    let mut other = ctx.raw_peer().await;
    other.send(reconnect("carol", &version, Some(&token))).await;
    let reply = other.recv().await.unwrap();
    assert_eq!(
        reply.get_str("message").as_deref(),
        Some("'carol' is already connected")
    );
}

#[tokio::test]
async fn test_fresh_connect_replaces_retained_session() {
    let ctx = TestServer::new().await;
    let version = ctx.server.config().version.clone();
    let (peer, _token) = raw_session(&ctx, "dave").await;
    let original = ctx.server.connection("dave").unwrap();
    drop(peer);
    wait_until_retained(&ctx, "dave").await;

    let mut fresh = ctx.raw_peer().await;
    let reply = fresh.hello("dave", &version).await.unwrap();
    assert!(reply.is(Reserved::SvrConnected));
    assert!(!reply.get_bool("resumed").unwrap());
    let replacement = ctx.server.connection("dave").unwrap();
    assert!(!Arc::ptr_eq(&original, &replacement));
}

#[tokio::test]
async fn test_name_match_resumes_without_token_when_allowed() {
    let mut config = server_config();
    config.require_resume_token = false;
    let ctx = TestServer::with_config(config).await;
    let version = ctx.server.config().version.clone();
    let (peer, _token) = raw_session(&ctx, "erin").await;
    let original = ctx.server.connection("erin").unwrap();
    drop(peer);
    wait_until_retained(&ctx, "erin").await;

    let mut again = ctx.raw_peer().await;
    let reply = again.hello("erin", &version).await.unwrap();
    assert!(reply.get_bool("resumed").unwrap());
    assert!(Arc::ptr_eq(&original, &ctx.server.connection("erin").unwrap()));
}

#[tokio::test]
async fn test_retention_expires() {
    let mut config = server_config();
    config.reconnect_window = Duration::from_millis(100);
    let ctx = TestServer::with_config(config).await;
    let version = ctx.server.config().version.clone();
    let (peer, token) = raw_session(&ctx, "frank").await;
    drop(peer);
    wait_until_retained(&ctx, "frank").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The old session is gone, so the token no longer matters.
    let mut late = ctx.raw_peer().await;
    late.send(reconnect("frank", &version, Some(&token))).await;
    let reply = late.recv().await.unwrap();
    assert!(reply.is(Reserved::SvrConnected));
    assert!(!reply.get_bool("resumed").unwrap());
}

#[tokio::test]
async fn test_retained_sessions_do_not_use_capacity() {
    let mut config = server_config();
    config.max_connections = 1;
    let ctx = TestServer::with_config(config).await;
    let (peer, _token) = raw_session(&ctx, "grace").await;
    drop(peer);
    wait_until_retained(&ctx, "grace").await;

    let client = ctx.connect("heidi").await;
    assert!(client.is_connected());
    assert_eq!(ctx.server.connections().len(), 2);
}

#[tokio::test]
async fn test_reset_starts_a_new_session() {
    let ctx = TestServer::new().await;
    let proxy = Proxy::start(ctx.addr()).await;
    let client = ClientSession::new(client_config_for(proxy.addr(), "ivan"));
    client.connect().await.unwrap();
    let server = ctx.server.clone();
    assert!(eventually(move || server.connection("ivan").is_some_and(|c| c.is_connected())).await);
    let original = ctx.server.connection("ivan").unwrap();

    proxy.sever();
    let session = client.session().clone();
    assert!(eventually(move || session.state() == ConnectionState::Disconnected).await);
    wait_until_retained(&ctx, "ivan").await;

    client.reset().unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);
    client.connect().await.unwrap();
    let replacement = ctx.server.connection("ivan").unwrap();
    assert!(!Arc::ptr_eq(&original, &replacement));
}

#[tokio::test]
async fn test_reset_requires_disconnected_session() {
    let ctx = TestServer::new().await;
    let client = ctx.connect("judy").await;
    assert!(client.reset().is_err());
    client.disconnect().await;
    assert!(client.reset().is_ok());
}
