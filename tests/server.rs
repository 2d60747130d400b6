//! Server scenarios over real UDP sockets on loopback

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blocknet::config::NetworkConfig;
use blocknet::core::packet::Packet;
use blocknet::core::schema::{FieldKind, FieldValue, PacketRegistry};
use blocknet::error::Result;
use blocknet::protocol::{ClientEvent, ClientSession, DisconnectReason, SessionId};
use blocknet::server::{GameSink, Server, SpawnContext};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

const CHAT: u32 = 0x20;

fn registry() -> PacketRegistry {
    let registry = PacketRegistry::new();
    registry
        .register_schema(CHAT, "Chat", vec![FieldKind::String])
        .unwrap();
    registry
}

fn chat(text: &str) -> Packet {
    Packet::game(CHAT, vec![FieldValue::String(text.into())])
}

fn config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| c.server.address = "127.0.0.1:0".into())
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(SessionId, Packet)>>,
    stall: bool,
}

impl GameSink for RecordingSink {
    fn spawn(&self, _ctx: SpawnContext) -> BoxFuture<'static, Result<Vec<Packet>>> {
        if self.stall {
            return Box::pin(futures::future::pending());
        }
        Box::pin(async { Ok(vec![chat("welcome")]) })
    }

    fn deliver(&self, session_id: SessionId, packet: Packet) {
        self.delivered.lock().unwrap().push((session_id, packet));
    }
}

type Disconnects = Arc<Mutex<Vec<(SessionId, DisconnectReason)>>>;

struct Harness {
    server: Arc<Server>,
    sink: Arc<RecordingSink>,
    disconnects: Disconnects,
    runner: JoinHandle<Result<()>>,
}

async fn start(config: NetworkConfig, sink: RecordingSink) -> Harness {
    let sink = Arc::new(sink);
    let disconnects: Disconnects = Arc::default();
    let seen = disconnects.clone();
    let server = Server::bind(config, registry(), sink.clone())
        .await
        .unwrap()
        .with_disconnect_hook(move |id: SessionId, _peer: SocketAddr, reason: DisconnectReason| {
            seen.lock().unwrap().push((id, reason));
        });
    let server = Arc::new(server);
    let runner = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    Harness {
        server,
        sink,
        disconnects,
        runner,
    }
}

struct TestClient {
    socket: UdpSocket,
    session: ClientSession,
    server: SocketAddr,
}

impl TestClient {
    async fn new(harness: &Harness, session: ClientSession) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            session,
            server: harness.server.local_addr().unwrap(),
        }
    }

    async fn flush(&mut self) {
        while let Some(datagram) = self.session.poll_transmit() {
            self.socket.send_to(&datagram, self.server).await.unwrap();
        }
    }

    /// Pump the socket until the session reports an event
    async fn next_event(&mut self, within: Duration) -> Option<ClientEvent> {
        let deadline = Instant::now() + within;
        let mut buf = vec![0u8; 64 * 1024];
        while Instant::now() < deadline {
            if let Some(event) = self.session.poll_event() {
                return Some(event);
            }
            self.flush().await;
            if let Ok(Ok((len, _))) =
                tokio::time::timeout(Duration::from_millis(20), self.socket.recv_from(&mut buf)).await
            {
                let _ = self
                    .session
                    .handle_datagram(Bytes::copy_from_slice(&buf[..len]), Instant::now());
            }
            let _ = self.session.tick(Instant::now());
        }
        self.session.poll_event()
    }

    async fn connect(&mut self) -> SessionId {
        self.session.connect(Instant::now()).unwrap();
        loop {
            match self.next_event(Duration::from_secs(5)).await {
                Some(ClientEvent::Connected { session_id }) => return session_id,
                Some(ClientEvent::Packet(_)) => continue,
                other => panic!("handshake did not complete: {other:?}"),
            }
        }
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_full_session_over_udp() {
    let harness = start(config(), RecordingSink::default()).await;
    let mut client = TestClient::new(&harness, ClientSession::new(&config(), registry())).await;

    client.session.connect(Instant::now()).unwrap();
    assert_eq!(
        client.next_event(Duration::from_secs(5)).await,
        Some(ClientEvent::Packet(chat("welcome")))
    );
    let Some(ClientEvent::Connected { session_id }) =
        client.next_event(Duration::from_secs(5)).await
    else {
        panic!("expected Connected");
    };
    assert_eq!(harness.server.session_count(), 1);

    client.session.send(&[chat("hi")], Instant::now()).unwrap();
    client.flush().await;
    let sink = harness.sink.clone();
    assert!(
        wait_until(
            || !sink.delivered.lock().unwrap().is_empty(),
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(
        sink.delivered.lock().unwrap()[0],
        (session_id, chat("hi"))
    );

    client.session.disconnect(Instant::now());
    client.flush().await;
    let disconnects = harness.disconnects.clone();
    assert!(wait_until(|| !disconnects.lock().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(
        *disconnects.lock().unwrap(),
        vec![(session_id, DisconnectReason::ClientDisconnect)]
    );
    assert!(wait_until(|| harness.server.session_count() == 0, Duration::from_secs(1)).await);

    harness.server.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_incompatible_version_leaves_no_session() {
    let harness = start(config(), RecordingSink::default()).await;
    let session = ClientSession::new(&config(), registry()).with_protocol_version(99);
    let mut client = TestClient::new(&harness, session).await;

    client.session.connect(Instant::now()).unwrap();
    assert!(matches!(
        client.next_event(Duration::from_secs(5)).await,
        Some(ClientEvent::Rejected { .. })
    ));
    assert_eq!(
        client.next_event(Duration::from_secs(1)).await,
        Some(ClientEvent::Disconnected(DisconnectReason::IncompatibleVersion))
    );

    assert_eq!(harness.server.session_count(), 0);
    assert_eq!(harness.server.metrics().snapshot().handshakes_rejected, 1);
    assert!(harness.disconnects.lock().unwrap().is_empty());

    harness.server.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.idle_timeout = Duration::from_millis(300);
        c.server.sweep_interval = Duration::from_millis(50);
        c.reliability.initial_rto = Duration::from_millis(200);
        c.reliability.max_rto = Duration::from_millis(250);
    });
    let harness = start(config.clone(), RecordingSink::default()).await;
    let mut client = TestClient::new(&harness, ClientSession::new(&config, registry())).await;
    let session_id = client.connect().await;

    // the client goes silent
    let disconnects = harness.disconnects.clone();
    assert!(wait_until(|| !disconnects.lock().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(
        *disconnects.lock().unwrap(),
        vec![(session_id, DisconnectReason::IdleTimeout)]
    );
    assert_eq!(harness.server.session_count(), 0);
    assert_eq!(harness.server.metrics().snapshot().idle_evictions, 1);

    harness.server.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stalled_spawn_fails_session() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.spawn_timeout = Duration::from_millis(100);
    });
    let sink = RecordingSink {
        stall: true,
        ..RecordingSink::default()
    };
    let harness = start(config.clone(), sink).await;
    let mut client = TestClient::new(&harness, ClientSession::new(&config, registry())).await;

    client.session.connect(Instant::now()).unwrap();
    assert_eq!(
        client.next_event(Duration::from_secs(5)).await,
        Some(ClientEvent::Disconnected(DisconnectReason::SpawnFailed))
    );
    let disconnects = harness.disconnects.clone();
    assert!(wait_until(|| !disconnects.lock().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(disconnects.lock().unwrap()[0].1, DisconnectReason::SpawnFailed);

    harness.server.shutdown();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_notifies_clients() {
    let harness = start(config(), RecordingSink::default()).await;
    let mut client = TestClient::new(&harness, ClientSession::new(&config(), registry())).await;
    let session_id = client.connect().await;

    harness.server.shutdown();
    assert_eq!(
        client.next_event(Duration::from_secs(5)).await,
        Some(ClientEvent::Disconnected(DisconnectReason::ServerShutdown))
    );
    harness.runner.await.unwrap().unwrap();
    assert_eq!(
        *harness.disconnects.lock().unwrap(),
        vec![(session_id, DisconnectReason::ServerShutdown)]
    );
}

#[tokio::test]
async fn test_session_limit_drops_handshakes() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.max_sessions = 1;
    });
    let harness = start(config.clone(), RecordingSink::default()).await;

    let mut first = TestClient::new(&harness, ClientSession::new(&config, registry())).await;
    first.connect().await;

    let mut second = TestClient::new(&harness, ClientSession::new(&config, registry())).await;
    second.session.connect(Instant::now()).unwrap();
    assert_eq!(second.next_event(Duration::from_millis(300)).await, None);
    assert_eq!(harness.server.session_count(), 1);

    harness.server.shutdown();
    harness.runner.await.unwrap().unwrap();
}
