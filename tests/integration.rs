//! Integration tests for the gateway over real loopback sockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mcwake::container::{ContainerController, ContainerRuntime, ContainerState, ContainerSummary};
use mcwake::protocol::{
    packet_id, put_string, put_varint, read_packet, write_packet, Handshake, Intention, LoginStart,
    Packet, TextComponent, MAX_JSON_CHARS,
};
use mcwake::proxy::{Gateway, GatewayServer};
use mcwake::status::{ServerListing, StatusResponse};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

const CONTAINER: &str = "minecraft";

/// In-memory container runtime
#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<Vec<ContainerSummary>>,
    start_calls: AtomicUsize,
    fail_start: bool,
    on_start: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakeRuntime {
    fn with_state(state: ContainerState) -> Self {
        let runtime = Self::default();
        runtime.set_container(state);
        runtime
    }

    fn set_container(&self, state: ContainerState) {
        *self.containers.lock() = vec![ContainerSummary {
            id: "c0ffee".to_string(),
            names: vec![format!("/{}", CONTAINER)],
            state,
        }];
    }

    fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_by_name(&self, _name: &str) -> anyhow::Result<Vec<ContainerSummary>> {
        Ok(self.containers.lock().clone())
    }

    async fn start_container(&self, _id: &str) -> anyhow::Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            anyhow::bail!("no such image");
        }
        for container in self.containers.lock().iter_mut() {
            container.state = ContainerState::Running;
        }
        if let Some(tx) = self.on_start.lock().take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

struct TestGateway {
    addr: SocketAddr,
    controller: Arc<ContainerController>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(runtime: Arc<FakeRuntime>, backend: &str, dial_timeout: Duration) -> TestGateway {
    let controller = Arc::new(ContainerController::new(runtime, CONTAINER));
    let listing = Arc::new(ServerListing::new(
        "1.21.4",
        769,
        &TextComponent::plain("Server is booting..."),
        None,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Gateway::new(backend, Arc::clone(&controller), listing).with_dial_timeout(dial_timeout);
    let server = GatewayServer::new(gateway, shutdown_rx);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    TestGateway {
        addr,
        controller,
        _shutdown_tx: shutdown_tx,
    }
}

/// An address nothing listens on, for now
async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_to_end_within(stream: &mut TcpStream, limit: Duration) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(limit, stream.read_to_end(&mut buf))
        .await
        .expect("connection should close")
        .unwrap();
    buf
}

async fn read_disconnect(stream: &mut TcpStream) -> TextComponent {
    let packet = tokio::time::timeout(Duration::from_secs(10), read_packet(stream))
        .await
        .expect("disconnect should arrive")
        .unwrap();
    assert_eq!(packet.id, packet_id::LOGIN_DISCONNECT);
    serde_json::from_str(&packet.read_string(MAX_JSON_CHARS).unwrap()).unwrap()
}

fn all_text(component: &TextComponent) -> String {
    let mut text = component.text.clone();
    for extra in &component.extra {
        text.push_str(&all_text(extra));
    }
    text
}

#[tokio::test]
async fn test_login_starts_container_and_relays() {
    // Nothing exists when the gateway first looks
    let runtime = Arc::new(FakeRuntime::default());
    let (started_tx, started_rx) = oneshot::channel();
    *runtime.on_start.lock() = Some(started_tx);

    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(25)).await;
    assert!(!gateway.controller.refresh().await.unwrap());
    assert_eq!(gateway.controller.state(), ContainerState::NotCreated);

    // The container gets created, stopped
    runtime.set_container(ContainerState::Exited);

    // Backend only comes up once the container is started
    let backend = tokio::spawn(async move {
        started_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let listener = TcpListener::bind(backend_addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let handshake = Handshake::decode(read_packet(&mut stream).await.unwrap()).unwrap();
        let login = LoginStart::decode(read_packet(&mut stream).await.unwrap()).unwrap();
        let mut after = [0u8; 11];
        stream.read_exact(&mut after).await.unwrap();

        stream.write_all(b"welcome").await.unwrap();
        stream.shutdown().await.unwrap();
        (handshake, login, after)
    });

    let handshake = Handshake::new(769, "play.example.com", 25565, Intention::Login);
    let login = LoginStart::new("Alice", Uuid::new_v4());

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, handshake.packet()).await.unwrap();
    write_packet(&mut client, login.packet()).await.unwrap();
    client.write_all(b"\x09\x00game-data").await.unwrap();

    let reply = read_to_end_within(&mut client, Duration::from_secs(10)).await;
    assert_eq!(reply, b"welcome");

    let (seen_handshake, seen_login, after) = backend.await.unwrap();
    assert_eq!(seen_handshake.packet().frame(), handshake.packet().frame());
    assert_eq!(seen_login.player_name, "Alice");
    assert_eq!(seen_login.player_id, login.player_id);
    assert_eq!(seen_login.packet().frame(), login.packet().frame());
    assert_eq!(&after, b"\x09\x00game-data");

    assert_eq!(runtime.starts(), 1);
    assert!(gateway.controller.is_running());
}

#[tokio::test]
async fn test_status_relayed_when_running() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Running));

    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(5)).await;

    let handshake = Handshake::new(770, "localhost", 25565, Intention::Status);
    let status_request = Packet::new(packet_id::STATUS_REQUEST, Bytes::new());

    let backend = tokio::spawn(async move {
        let (mut stream, _) = backend_listener.accept().await.unwrap();
        let first = read_packet(&mut stream).await.unwrap();
        let second = read_packet(&mut stream).await.unwrap();

        let listing = r#"{"version":{"name":"Paper 1.21.4","protocol":769},"players":{"max":20,"online":4},"description":{"text":"live"}}"#;
        write_packet(&mut stream, &Packet::status_response(listing)).await.unwrap();
        (first, second)
    });

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, handshake.packet()).await.unwrap();
    write_packet(&mut client, &status_request).await.unwrap();

    let response = read_packet(&mut client).await.unwrap();
    let status: StatusResponse =
        serde_json::from_str(&response.read_string(MAX_JSON_CHARS).unwrap()).unwrap();
    assert_eq!(status.players.online, 4);
    assert_eq!(status.version.name, "Paper 1.21.4");

    let (first, second) = backend.await.unwrap();
    assert_eq!(first.frame(), handshake.packet().frame());
    assert_eq!(second.frame(), status_request.frame());
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test]
async fn test_login_disconnected_when_backend_never_comes_up() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Running));
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(runtime, &backend_addr.to_string(), Duration::from_secs(1)).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, Handshake::new(769, "localhost", 25565, Intention::Login).packet())
        .await
        .unwrap();
    write_packet(&mut client, LoginStart::new("Bob", Uuid::new_v4()).packet())
        .await
        .unwrap();

    let reason = read_disconnect(&mut client).await;
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(reason.color.as_deref(), Some("yellow"));
    assert!(reason.text.starts_with("Server is starting"));

    // Connection closes after the message
    assert!(read_to_end_within(&mut client, Duration::from_secs(5)).await.is_empty());
}

#[tokio::test]
async fn test_status_answered_locally_when_stopped() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Exited));
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(1)).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, Handshake::new(770, "localhost", 25565, Intention::Status).packet())
        .await
        .unwrap();
    write_packet(&mut client, &Packet::new(packet_id::STATUS_REQUEST, Bytes::new()))
        .await
        .unwrap();

    let response = read_packet(&mut client).await.unwrap();
    assert_eq!(response.id, packet_id::STATUS_RESPONSE);
    let status: StatusResponse =
        serde_json::from_str(&response.read_string(MAX_JSON_CHARS).unwrap()).unwrap();
    assert_eq!(status.version.protocol, 769);
    assert_eq!(status.version.name, "1.21.4");
    assert_eq!(status.players.max, 0);
    assert_eq!(status.players.online, 0);
    assert_eq!(status.description["text"], "Server is booting...");

    let ping = Packet::new(packet_id::PING, 42i64.to_be_bytes().to_vec());
    write_packet(&mut client, &ping).await.unwrap();
    assert_eq!(read_packet(&mut client).await.unwrap(), ping);

    // Status pings never start the server
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test]
async fn test_start_failure_sends_disconnect() {
    let runtime = Arc::new(FakeRuntime {
        fail_start: true,
        ..FakeRuntime::with_state(ContainerState::Exited)
    });
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(5)).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, Handshake::new(769, "localhost", 25565, Intention::Login).packet())
        .await
        .unwrap();
    write_packet(&mut client, LoginStart::new("Carol", Uuid::new_v4()).packet())
        .await
        .unwrap();

    let reason = read_disconnect(&mut client).await;
    assert_eq!(reason.color.as_deref(), Some("red"));
    assert!(all_text(&reason).contains("Failed to start server"));
    assert_eq!(runtime.starts(), 1);
    assert!(!gateway.controller.is_running());
}

#[tokio::test]
async fn test_missing_container_sends_start_failure() {
    let runtime = Arc::new(FakeRuntime::default());
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(5)).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, Handshake::new(769, "localhost", 25565, Intention::Login).packet())
        .await
        .unwrap();
    write_packet(&mut client, LoginStart::new("Dave", Uuid::new_v4()).packet())
        .await
        .unwrap();

    let reason = read_disconnect(&mut client).await;
    assert!(all_text(&reason).contains("Failed to start server"));
    assert_eq!(runtime.starts(), 0);
    assert_eq!(gateway.controller.state(), ContainerState::NotCreated);
}

#[tokio::test]
async fn test_wrong_login_packet_closes_connection() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Exited));
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(5)).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, Handshake::new(769, "localhost", 25565, Intention::Login).packet())
        .await
        .unwrap();
    write_packet(&mut client, &Packet::new(0x03, vec![0x01, 0x02]))
        .await
        .unwrap();

    assert!(read_to_end_within(&mut client, Duration::from_secs(5)).await.is_empty());
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test]
async fn test_unknown_intention_closes_connection() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Exited));
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(5)).await;

    // Intention 3 is a server transfer, which the gateway does not handle
    let mut payload = BytesMut::new();
    put_varint(&mut payload, 769);
    put_string(&mut payload, "localhost");
    payload.extend_from_slice(&25565u16.to_be_bytes());
    put_varint(&mut payload, 3);

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, &Packet::new(packet_id::HANDSHAKE, payload.freeze()))
        .await
        .unwrap();

    assert!(read_to_end_within(&mut client, Duration::from_secs(5)).await.is_empty());
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test]
async fn test_concurrent_logins_start_once_when_running() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Running));

    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(5)).await;

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            tokio::spawn(async move {
                let _ = read_packet(&mut stream).await;
                let _ = read_packet(&mut stream).await;
                let _ = stream.write_all(b"ok").await;
            });
        }
    });

    let mut clients = Vec::new();
    for i in 0..8 {
        let addr = gateway.addr;
        clients.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            write_packet(&mut client, Handshake::new(769, "localhost", 25565, Intention::Login).packet())
                .await
                .unwrap();
            write_packet(&mut client, LoginStart::new(&format!("player{}", i), Uuid::new_v4()).packet())
                .await
                .unwrap();
            client.shutdown().await.unwrap();
            read_to_end_within(&mut client, Duration::from_secs(10)).await
        }));
    }

    for client in clients {
        assert_eq!(client.await.unwrap(), b"ok");
    }
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Exited));
    let controller = Arc::new(ContainerController::new(runtime, CONTAINER));
    let listing = Arc::new(ServerListing::new("1.21.4", 769, &TextComponent::plain("booting"), None));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::new(Gateway::new("127.0.0.1:1", controller, listing), shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server should stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_status_falls_back_to_listing_when_backend_unreachable() {
    // Cache says running but nothing answers on the backend port
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Running));
    let backend_addr = unused_addr().await;
    let gateway = start_gateway(Arc::clone(&runtime), &backend_addr.to_string(), Duration::from_secs(1)).await;

    let started = Instant::now();
    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    write_packet(&mut client, Handshake::new(770, "localhost", 25565, Intention::Status).packet())
        .await
        .unwrap();
    write_packet(&mut client, &Packet::new(packet_id::STATUS_REQUEST, Bytes::new()))
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(10), read_packet(&mut client))
        .await
        .expect("status response should arrive")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(900));

    // A status response, never a login disconnect
    let status: StatusResponse =
        serde_json::from_str(&response.read_string(MAX_JSON_CHARS).unwrap()).unwrap();
    assert_eq!(status.version.protocol, 769);
    assert_eq!(status.players.online, 0);
    assert_eq!(status.description["text"], "Server is booting...");

    let ping = Packet::new(packet_id::PING, 7i64.to_be_bytes().to_vec());
    write_packet(&mut client, &ping).await.unwrap();
    assert_eq!(read_packet(&mut client).await.unwrap(), ping);
    assert_eq!(runtime.starts(), 0);
}

#[tokio::test]
async fn test_silent_client_is_dropped() {
    let runtime = Arc::new(FakeRuntime::with_state(ContainerState::Exited));
    let controller = Arc::new(ContainerController::new(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>, CONTAINER));
    let listing = Arc::new(ServerListing::new("1.21.4", 769, &TextComponent::plain("booting"), None));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Gateway::new("127.0.0.1:1", controller, listing)
        .with_handshake_timeout(Duration::from_millis(300));
    tokio::spawn(GatewayServer::new(gateway, shutdown_rx).serve(listener));

    // Connect and send nothing
    let started = Instant::now();
    let mut idle = TcpStream::connect(addr).await.unwrap();
    assert!(read_to_end_within(&mut idle, Duration::from_secs(5)).await.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(250));

    // A client that stops after the handshake is dropped too
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    write_packet(&mut stalled, Handshake::new(769, "localhost", 25565, Intention::Login).packet())
        .await
        .unwrap();
    assert!(read_to_end_within(&mut stalled, Duration::from_secs(5)).await.is_empty());
    assert_eq!(runtime.starts(), 0);
}
