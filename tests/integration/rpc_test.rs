// tests/integration/rpc_test.rs

//! Integration tests for remote calls between connected peers
//! Tests: results, fire-and-forget, errors, cancellation, disconnect during a call

use super::test_helpers::{EventLog, TestServer, client_config_for, eventually, server_config};
use questlink::core::SessionError;
use questlink::core::protocol::{ArgValue, CodecKind, Command, Reserved};
use questlink::core::rpc::{ParamKind, RemoteObject, RemoteRegistry, RpcOutcome, RpcValue};
use questlink::{ClientSession, Server};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct RpcFixture {
    ctx: TestServer,
    _calculator: Arc<RemoteObject>,
    calls: Arc<AtomicUsize>,
    started: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
}

impl RpcFixture {
    async fn new() -> Self {
        Self::with_config(server_config()).await
    }

    async fn with_config(config: questlink::config::Config) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicBool::new(false));
        let interrupted = Arc::new(AtomicBool::new(false));
        let counter = calls.clone();
        let (start_flag, interrupt_flag) = (started.clone(), interrupted.clone());

        let calculator = Arc::new(
            RemoteObject::new("Calculator")
                .method("sum", vec![ParamKind::Int, ParamKind::Int], |_, args| {
                    Ok(RpcValue::Int(args.i32(0)? + args.i32(1)?))
                })
                .method("tally", vec![], move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(RpcValue::Null)
                })
                .method("fail", vec![], |_, _| Err("board is full".to_string()))
                .method("resign", vec![], |ctx, _| {
                    ctx.cancel();
                    Ok(RpcValue::Null)
                })
                .method("ponder", vec![], move |ctx, _| {
                    start_flag.store(true, Ordering::SeqCst);
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while !ctx.is_interrupted() && Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    interrupt_flag.store(ctx.is_interrupted(), Ordering::SeqCst);
                    Ok(RpcValue::Str("done".into()))
                }),
        );
        let remote = Arc::new(RemoteRegistry::new());
        remote.register("calc", &calculator);

        super::test_helpers::init_tracing();
        let server = Server::bind_with(config, remote).await.unwrap();
        server.start().unwrap();
        Self {
            ctx: TestServer { server },
            _calculator: calculator,
            calls,
            started,
            interrupted,
        }
    }
}

#[tokio::test]
async fn test_call_returns_value() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.connect("alice").await;

    let outcome = client
        .invoke("calc", "sum", true, vec![RpcValue::Int(2), RpcValue::Int(3)])
        .await
        .unwrap();
    assert_eq!(outcome, RpcOutcome::Returned(RpcValue::Int(5)));
    assert!(client.session().pending_calls().is_empty());
}

#[tokio::test]
async fn test_widened_arguments() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.connect("bob").await;

    let outcome = client
        .invoke("calc", "sum", true, vec![RpcValue::Byte(40), RpcValue::Short(2)])
        .await
        .unwrap();
    assert_eq!(outcome.value(), Some(RpcValue::Int(42)));
}

#[tokio::test]
async fn test_concurrent_calls_are_matched() {
    let fixture = RpcFixture::new().await;
    let client = Arc::new(fixture.ctx.connect("carol").await);

    let mut calls = Vec::new();
    for n in 0..20 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let outcome = client
                .invoke("calc", "sum", true, vec![RpcValue::Int(n), RpcValue::Int(n)])
                .await
                .unwrap();
            (n, outcome)
        }));
    }
    for call in calls {
        let (n, outcome) = call.await.unwrap();
        assert_eq!(outcome, RpcOutcome::Returned(RpcValue::Int(2 * n)));
    }
}

#[tokio::test]
async fn test_fire_and_forget() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.connect("dave").await;

    for _ in 0..3 {
        let outcome = client.invoke("calc", "tally", false, vec![]).await.unwrap();
        assert_eq!(outcome, RpcOutcome::Dispatched);
    }
    let calls = fixture.calls.clone();
    assert!(eventually(move || calls.load(Ordering::SeqCst) == 3).await);
}

#[tokio::test]
async fn test_oversized_call_fails_fast() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.connect("fern").await;

    let huge = RpcValue::Str("x".repeat(17 * 1024 * 1024));
    let err = client
        .invoke("calc", "sum", true, vec![huge, RpcValue::Int(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::FrameTooLarge(_)));
    assert!(client.session().pending_calls().is_empty());
    assert!(client.is_connected());

    let outcome = client
        .invoke("calc", "sum", true, vec![RpcValue::Int(1), RpcValue::Int(1)])
        .await
        .unwrap();
    assert_eq!(outcome.value(), Some(RpcValue::Int(2)));
}

#[tokio::test]
async fn test_remote_errors_do_not_close_the_session() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.connect("erin").await;

    let err = client.invoke("calc", "fail", true, vec![]).await.unwrap_err();
    assert_eq!(err, SessionError::Rpc("board is full".to_string()));

    let err = client.invoke("ghost", "sum", true, vec![]).await.unwrap_err();
    assert!(matches!(err, SessionError::Rpc(message) if message.contains("ghost")));

    let err = client
        .invoke("calc", "sum", true, vec![RpcValue::Str("two".into())])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Rpc(_)));

    assert!(client.is_connected());
    let outcome = client
        .invoke("calc", "sum", true, vec![RpcValue::Int(1), RpcValue::Int(1)])
        .await
        .unwrap();
    assert_eq!(outcome.value(), Some(RpcValue::Int(2)));
}

#[tokio::test]
async fn test_cancelled_call() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.connect("frank").await;
    let log = Arc::new(EventLog::default());
    client.add_listener(log.clone());

    let outcome = client.invoke("calc", "resign", true, vec![]).await.unwrap();
    assert_eq!(outcome, RpcOutcome::Cancelled);
    assert!(log.has_event("cancelled"));
}

#[tokio::test]
async fn test_disconnect_during_call() {
    let fixture = RpcFixture::new().await;
    let client = Arc::new(fixture.ctx.connect("grace").await);

    let caller = client.clone();
    let call = tokio::spawn(async move { caller.invoke("calc", "ponder", true, vec![]).await });
    let started = fixture.started.clone();
    assert!(eventually(move || started.load(Ordering::SeqCst)).await);

    client.disconnect().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("invoke did not return after disconnect")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RpcOutcome::Disconnected);
    assert!(client.session().pending_calls().is_empty());

    // The server interrupts the worker once the calling session is gone.
    let interrupted = fixture.interrupted.clone();
    assert!(eventually(move || interrupted.load(Ordering::SeqCst)).await);
}

#[tokio::test]
async fn test_invoke_requires_connection() {
    let fixture = RpcFixture::new().await;
    let client = fixture.ctx.client("heidi");
    assert_eq!(
        client.invoke("calc", "sum", true, vec![]).await.unwrap_err(),
        SessionError::NotConnected
    );
}

#[tokio::test]
async fn test_server_calls_client() {
    let ctx = TestServer::new().await;
    let board = Arc::new(RemoteObject::new("Board").method(
        "place",
        vec![ParamKind::Str, ParamKind::Long],
        |ctx, args| {
            assert_eq!(ctx.target(), "board");
            Ok(RpcValue::Str(format!("{}@{}", args.str(0)?, args.i64(1)?)))
        },
    ));
    let remote = Arc::new(RemoteRegistry::new());
    remote.register("board", &board);
    let client = ClientSession::with_registry(ctx.client_config("ivan"), remote);
    client.connect().await.unwrap();

    let connection = ctx.server.connection("ivan").unwrap();
    let outcome = connection
        .invoke("board", "place", true, vec!["e4".into(), RpcValue::Int(7)])
        .await
        .unwrap();
    assert_eq!(outcome.value(), Some(RpcValue::Str("e4@7".into())));
}

#[tokio::test]
async fn test_object_arguments() {
    let ctx = TestServer::new().await;
    let inspector = Arc::new(RemoteObject::new("Inspector").method(
        "inspect",
        vec![ParamKind::Object("Piece".into())],
        |_, args| match args.get(0) {
            Some(RpcValue::Object { class, fields }) => Ok(RpcValue::Str(format!(
                "{class} on {}",
                fields.get("square").map(ToString::to_string).unwrap_or_default()
            ))),
            other => Err(format!("unexpected {other:?}")),
        },
    ));
    ctx.server.remote().register("inspector", &inspector);
    ctx.server.remote().declare_subtype("Rook", "Piece");
    let client = ctx.connect("judy").await;

    let rook = RpcValue::object("Rook").with_field("square", "a1");
    let outcome = client
        .invoke("inspector", "inspect", true, vec![rook])
        .await
        .unwrap();
    assert_eq!(outcome.value(), Some(RpcValue::Str("Rook on a1".into())));
}

#[tokio::test]
async fn test_typed_codec_end_to_end() {
    let mut config = server_config();
    config.codec = CodecKind::Typed;
    let fixture = RpcFixture::with_config(config).await;
    let mut client_config = client_config_for(fixture.ctx.addr(), "ken");
    client_config.codec = CodecKind::Typed;
    let client = ClientSession::new(client_config);
    client.connect().await.unwrap();

    let outcome = client
        .invoke("calc", "sum", true, vec![RpcValue::Int(20), RpcValue::Int(22)])
        .await
        .unwrap();
    assert_eq!(outcome.value(), Some(RpcValue::Int(42)));

    let log = Arc::new(EventLog::default());
    fixture
        .ctx
        .server
        .connection("ken")
        .unwrap()
        .session()
        .add_listener(log.clone());
    client
        .send(Command::new(Reserved::Message).with("turn", 9i32).with("ratio", 0.5f64))
        .unwrap();
    let watched = log.clone();
    assert!(eventually(move || watched.command_count() == 1).await);
    let command = log.commands.lock()[0].clone();
    assert_eq!(command.get("turn"), Some(&ArgValue::Int(9)));
    assert_eq!(command.get("ratio"), Some(&ArgValue::Double(0.5)));
}
