// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::core::packet::{KeepAlive, Packet};
use crate::core::schema::{FieldKind, FieldValue, PacketRegistry};
use crate::error::ProtocolError;
use crate::protocol::{
    ClientEvent, ClientSession, DisconnectReason, Session, SessionContext, SessionEvent,
    SessionState,
};
use crate::reliability::datagram::Reliability;
use crate::reliability::ReliabilityLayer;
use crate::utils::compression::CompressionKind;

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

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

fn server_with(config: NetworkConfig, now: Instant) -> Session {
    Session::new(7, peer(), SessionContext::new(config, registry()), now)
}

/// Move datagrams both ways until neither side has anything left to send
fn pump(client: &mut ClientSession, server: &mut Session, now: Instant) {
    loop {
        let mut moved = false;
        while let Some(d) = client.poll_transmit() {
            server.handle_datagram(d, now);
            moved = true;
        }
        while let Some(d) = server.poll_transmit() {
            client.handle_datagram(d, now).unwrap();
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

fn server_events(server: &mut Session) -> Vec<SessionEvent> {
    std::iter::from_fn(|| server.poll_event()).collect()
}

fn client_events(client: &mut ClientSession) -> Vec<ClientEvent> {
    std::iter::from_fn(|| client.poll_event()).collect()
}

/// Run the handshake to the play state with a one-packet spawn snapshot
fn connected(config: NetworkConfig, now: Instant) -> (ClientSession, Session) {
    let mut server = server_with(config.clone(), now);
    let mut client = ClientSession::new(&config, registry());

    client.connect(now).unwrap();
    pump(&mut client, &mut server, now);
    assert_eq!(server.state(), SessionState::Spawning);
    assert_eq!(server_events(&mut server), vec![SessionEvent::SpawnRequested]);

    server.complete_spawn(Ok(vec![chat("welcome")]), now);
    pump(&mut client, &mut server, now);
    (client, server)
}

#[test]
fn test_handshake_reaches_play_state() {
    let now = Instant::now();
    let (mut client, server) = connected(NetworkConfig::default(), now);

    assert_eq!(server.state(), SessionState::Active);
    assert!(server.is_encrypted());
    assert_eq!(server.compression(), Some(CompressionKind::Zstd));
    assert_eq!(client.compression(), Some(CompressionKind::Zstd));
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(
        client_events(&mut client),
        vec![
            ClientEvent::Packet(chat("welcome")),
            ClientEvent::Connected { session_id: 7 },
        ]
    );
}

#[test]
fn test_server_preference_decides_compression() {
    let now = Instant::now();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.transport.compression_preference = vec![CompressionKind::Lz4, CompressionKind::Zstd];
    });
    let mut server = server_with(config.clone(), now);
    let mut client =
        ClientSession::new(&config, registry()).with_algorithms(vec![CompressionKind::Zstd]);

    client.connect(now).unwrap();
    pump(&mut client, &mut server, now);
    assert_eq!(server.compression(), Some(CompressionKind::Zstd));

    let config = NetworkConfig::default_with_overrides(|c| c.transport.compression_enabled = false);
    let mut server = server_with(config.clone(), now);
    let mut client = ClientSession::new(&config, registry());
    client.connect(now).unwrap();
    pump(&mut client, &mut server, now);
    assert_eq!(server.state(), SessionState::Spawning);
    assert_eq!(server.compression(), None);
}

#[test]
fn test_game_packets_flow_both_ways() {
    let now = Instant::now();
    let (mut client, mut server) = connected(NetworkConfig::default(), now);
    server_events(&mut server);
    client_events(&mut client);

    client.send(&[chat("hello"), chat("world")], now).unwrap();
    server.send(&[chat(&"long line ".repeat(500))], now).unwrap();
    pump(&mut client, &mut server, now);

    assert_eq!(
        server_events(&mut server),
        vec![
            SessionEvent::Deliver(chat("hello")),
            SessionEvent::Deliver(chat("world")),
        ]
    );
    assert_eq!(
        client_events(&mut client),
        vec![ClientEvent::Packet(chat(&"long line ".repeat(500)))]
    );
}

#[test]
fn test_incompatible_version_rejected() {
    let now = Instant::now();
    let config = NetworkConfig::default();
    let mut server = server_with(config.clone(), now);
    let mut client = ClientSession::new(&config, registry()).with_protocol_version(99);

    client.connect(now).unwrap();
    pump(&mut client, &mut server, now);

    assert_eq!(server.state(), SessionState::Closed);
    assert_eq!(
        server_events(&mut server),
        vec![SessionEvent::Closed(DisconnectReason::IncompatibleVersion)]
    );
    assert_eq!(
        client_events(&mut client),
        vec![
            ClientEvent::Rejected {
                server_version: crate::config::PROTOCOL_VERSION
            },
            ClientEvent::Disconnected(DisconnectReason::IncompatibleVersion),
        ]
    );
}

#[test]
fn test_unexpected_packets_force_violation_disconnect() {
    let now = Instant::now();
    let config = NetworkConfig::default_with_overrides(|c| c.session.max_violations = 2);
    let mut server = server_with(config.clone(), now);

    // a peer that skips the handshake and talks plaintext keepalives
    let mut rogue = ReliabilityLayer::new(&config.reliability);
    let body = crate::core::batch::encode_batch(
        &[Packet::KeepAlive(KeepAlive {
            ping_id: 1,
            response: false,
        })],
        &registry(),
    )
    .unwrap();
    for _ in 0..3 {
        rogue
            .send(body.clone(), Reliability::ReliableOrdered, 0)
            .unwrap();
    }
    rogue.flush(now);
    while let Some(d) = rogue.poll_transmit() {
        server.handle_datagram(d, now);
    }

    assert_eq!(server.violations(), 3);
    assert_eq!(
        server.close_reason(),
        Some(DisconnectReason::ProtocolViolation)
    );
}

#[test]
fn test_garbage_datagram_counts_as_violation() {
    let now = Instant::now();
    let mut server = server_with(NetworkConfig::default(), now);
    server.handle_datagram(bytes::Bytes::from_static(&[0x13, 0x37]), now);
    assert_eq!(server.violations(), 1);
    assert_eq!(server.state(), SessionState::Handshaking);
}

#[test]
fn test_handshake_timeout() {
    let now = Instant::now();
    let config = NetworkConfig::default();
    let deadline = config.server.handshake_timeout;
    let mut server = server_with(config, now);

    server.tick(now + deadline / 2);
    assert_eq!(server.state(), SessionState::Handshaking);
    server.tick(now + deadline);
    assert_eq!(
        server_events(&mut server),
        vec![SessionEvent::Closed(DisconnectReason::HandshakeFailed)]
    );
}

#[test]
fn test_keepalive_ping_and_echo() {
    let now = Instant::now();
    let config = NetworkConfig::default();
    let interval = config.session.keepalive_interval;
    let (mut client, mut server) = connected(config, now);

    let later = now + interval;
    server.tick(later);
    pump(&mut client, &mut server, later);
    // the echo refreshed the keepalive clock, so this is not a timeout
    server.tick(later + Duration::from_secs(29));
    assert_eq!(server.state(), SessionState::Active);
}

#[test]
fn test_keepalive_timeout_disconnects() {
    let now = Instant::now();
    let config = NetworkConfig::default();
    let timeout = config.session.keepalive_timeout;
    let (_client, mut server) = connected(config, now);
    server_events(&mut server);

    server.tick(now + timeout);
    assert_eq!(
        server_events(&mut server),
        vec![SessionEvent::Closed(DisconnectReason::KeepAliveTimeout)]
    );
    // the disconnect notice is still queued for the peer
    assert!(server.poll_transmit().is_some());
}

#[test]
fn test_client_disconnect() {
    let now = Instant::now();
    let (mut client, mut server) = connected(NetworkConfig::default(), now);
    server_events(&mut server);

    client.disconnect(now);
    pump(&mut client, &mut server, now);
    assert_eq!(
        server_events(&mut server),
        vec![SessionEvent::Closed(DisconnectReason::ClientDisconnect)]
    );
}

#[test]
fn test_disconnect_during_compression_negotiation_sends_no_notice() {
    let now = Instant::now();
    let config = NetworkConfig::default();
    let deadline = config.server.handshake_timeout;
    let mut server = server_with(config.clone(), now);
    let mut client = ClientSession::new(&config, registry());

    client.connect(now).unwrap();
    while let Some(d) = client.poll_transmit() {
        server.handle_datagram(d, now);
    }
    while let Some(d) = server.poll_transmit() {
        client.handle_datagram(d, now).unwrap();
    }
    assert_eq!(client.state(), SessionState::CompressionNegotiated);

    client.disconnect(now);
    assert_eq!(
        client_events(&mut client),
        vec![ClientEvent::Disconnected(DisconnectReason::ClientDisconnect)]
    );
    while let Some(d) = client.poll_transmit() {
        server.handle_datagram(d, now);
    }
    // the confirm and compression request went through, nothing unframed after them
    assert_eq!(server.state(), SessionState::Spawning);
    assert_eq!(server.violations(), 0);
    assert_eq!(server_events(&mut server), vec![SessionEvent::SpawnRequested]);

    server.tick(now + deadline);
    assert_eq!(server.close_reason(), Some(DisconnectReason::HandshakeFailed));
}

#[test]
fn test_spawn_failure_closes_session() {
    let now = Instant::now();
    let config = NetworkConfig::default();
    let mut server = server_with(config.clone(), now);
    let mut client = ClientSession::new(&config, registry());
    client.connect(now).unwrap();
    pump(&mut client, &mut server, now);
    server_events(&mut server);

    server.complete_spawn(Err(ProtocolError::SinkError("world not loaded".into())), now);
    pump(&mut client, &mut server, now);
    assert_eq!(server.close_reason(), Some(DisconnectReason::SpawnFailed));
    assert_eq!(
        client_events(&mut client),
        vec![ClientEvent::Disconnected(DisconnectReason::SpawnFailed)]
    );
}

#[test]
fn test_unacknowledged_peer_is_lost() {
    let now = Instant::now();
    let config = NetworkConfig::default_with_overrides(|c| {
        c.session.keepalive_timeout = Duration::from_secs(3600);
        c.reliability.max_retransmissions = 3;
    });
    let (_client, mut server) = connected(config, now);
    server_events(&mut server);

    // the client never answers again
    let mut at = now;
    for _ in 0..10 {
        at += Duration::from_secs(5);
        server.tick(at);
        while server.poll_transmit().is_some() {}
    }
    assert_eq!(
        server.close_reason(),
        Some(DisconnectReason::RetransmissionExceeded)
    );
}

#[test]
fn test_tampered_batch_fails_decryption() {
    let now = Instant::now();
    let (mut client, mut server) = connected(NetworkConfig::default(), now);
    server_events(&mut server);

    client.send(&[chat("sneaky")], now).unwrap();
    let mut datagram = client.poll_transmit().unwrap().to_vec();
    // the auth tag sits at the end of the only frame body
    *datagram.last_mut().unwrap() ^= 0x01;
    server.handle_datagram(bytes::Bytes::from(datagram), now);

    assert_eq!(
        server_events(&mut server),
        vec![SessionEvent::Closed(DisconnectReason::DecryptionFailed)]
    );
}
