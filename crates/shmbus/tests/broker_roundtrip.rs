//! Bus connections talking through a real broker socket.

use std::path::Path;
use std::time::Duration;

use shmbus::bus::{Broker, BusTransport};
use shmbus::{
    AsyncBusConnection, BusConfig, BusConnection, BusType, CallAddress, Content, Encoding, IpcError,
    NameFlags, SocketTransport,
};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

const SERVICE: &str = "com.example.Echo";

struct Harness {
    broker: Broker,
    shutdown: CancellationToken,
    transport: SocketTransport,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let broker = Broker::new();
        let shutdown = CancellationToken::new();
        let (b, s) = (broker.clone(), shutdown.clone());
        tokio::spawn(async move { b.serve(listener, s).await });

        Self {
            broker,
            shutdown,
            transport: transport_for(&path),
            _dir: dir,
        }
    }
}

fn transport_for(path: &Path) -> SocketTransport {
    SocketTransport::new(
        BusConfig::default()
            .with_address(BusType::Session, path)
            .with_request_timeout(Duration::from_secs(5)),
    )
}

/// Run blocking bus code off the runtime threads.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn call_travels_from_client_to_named_server() {
    let h = Harness::start();
    let transport = h.transport.clone();

    let got = blocking(move || {
        let mut server = BusConnection::initialize_with(&transport, SERVICE, BusType::Session, None).unwrap();
        let mut client = BusConnection::open_with(&transport, BusType::Session).unwrap();

        client
            .enqueue_call(&CallAddress::new(SERVICE, "other"), 1, "skip me", None)
            .unwrap();
        client
            .enqueue_call(
                &CallAddress::new(SERVICE, "echo").with_interface("com.example.Echo1"),
                7,
                "grüße",
                Some(Encoding::Utf16),
            )
            .unwrap();

        let got = server
            .listen_call(Some("com.example.Echo1"), "echo", Some(Encoding::Utf16))
            .unwrap();
        assert_eq!(got.sender.as_deref(), Some(client.unique_name()));
        got
    })
    .await;

    assert_eq!(got.cmd_type, 7);
    assert_eq!(got.content, Content::Text("grüße".to_string()));
    assert_eq!(got.object, "/com/example/Echo");
    h.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn name_ownership_is_enforced_across_clients() {
    let h = Harness::start();
    let transport = h.transport.clone();

    blocking(move || {
        let owner = BusConnection::initialize_with(
            &transport,
            SERVICE,
            BusType::Session,
            Some(NameFlags::ALLOW_REPLACEMENT),
        )
        .unwrap();

        let refused = BusConnection::initialize_with(
            &transport,
            SERVICE,
            BusType::Session,
            Some(NameFlags::DO_NOT_QUEUE),
        )
        .unwrap_err();
        assert!(matches!(refused, IpcError::ConnectFailed { code: 3, .. }));

        let replacement =
            BusConnection::initialize_with(&transport, SERVICE, BusType::Session, None).unwrap();
        assert_eq!(replacement.service_name(), Some(SERVICE));
        drop(replacement);
        drop(owner);
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.broker.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.broker.owner(SERVICE), None);
    h.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_and_size_failures() {
    let h = Harness::start();
    let transport = h.transport.clone();

    blocking(move || {
        let mut client = BusConnection::open_with(&transport, BusType::Session).unwrap();

        let err = client
            .enqueue_call(&CallAddress::new("com.example.Missing", "x"), 0, "x", None)
            .unwrap_err();
        assert!(matches!(err, IpcError::DispatchFailed { .. }));

        let big = "x".repeat(4097);
        let err = client
            .enqueue_call(&CallAddress::new(SERVICE, "x"), 0, &big, None)
            .unwrap_err();
        assert!(matches!(err, IpcError::ContentTooLarge { size: 4097, limit: 4096 }));

        // The link survives both failures.
        assert!(client.try_listen_call(None, "x", None).unwrap().is_none());
    })
    .await;
    h.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn broker_shutdown_is_seen_as_connection_lost() {
    let h = Harness::start();
    let transport = h.transport.clone();

    let listener = tokio::task::spawn_blocking(move || {
        let mut server = BusConnection::initialize_with(&transport, SERVICE, BusType::Session, None).unwrap();
        server.listen_call(None, "never", None)
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.broker.owner(SERVICE).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    h.shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(IpcError::ConnectionLost { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_broker_fails_connect() {
    let dir = tempfile::tempdir().unwrap();
    let transport = transport_for(&dir.path().join("absent.sock"));

    let err = blocking(move || BusConnection::open_with(&transport, BusType::Session).unwrap_err()).await;
    assert!(matches!(err, IpcError::ConnectFailed { service: None, .. }));
    assert!(err.code().is_some_and(|code| code > 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn async_handles_over_socket() {
    let h = Harness::start();
    let transport = h.transport.clone();

    let (server, client) = blocking(move || {
        (
            BusConnection::initialize_with(&transport, SERVICE, BusType::Session, None).unwrap(),
            BusConnection::open_with(&transport, BusType::Session).unwrap(),
        )
    })
    .await;
    let server = AsyncBusConnection::new(server).with_poll_interval(Duration::from_millis(10));
    let client = AsyncBusConnection::new(client);

    let pending = {
        let server = server.clone();
        tokio::spawn(async move { server.listen_call(None, "ping", None).await })
    };
    client
        .enqueue_call(CallAddress::new(SERVICE, "ping"), 3, &[9u8, 8, 7], None)
        .await
        .unwrap();

    let got = pending.await.unwrap().unwrap();
    let Content::Bytes(raw) = got.content else {
        panic!("expected raw bytes");
    };
    assert_eq!(raw.len(), shmbus::MAX_CONTENT_LEN);
    assert_eq!(&raw[..3], &[9, 8, 7]);

    server.close().await.unwrap();
    client.close().await.unwrap();
    assert!(matches!(
        server.listen_call(None, "ping", None).await,
        Err(IpcError::Closed { .. })
    ));
    h.shutdown.cancel();
}

#[test]
fn transport_reports_configured_buffer() {
    let transport = SocketTransport::new(BusConfig::default().with_receive_buffer(8192));
    assert_eq!(transport.receive_buffer(), 8192);
}
