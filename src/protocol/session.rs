//! Server-side session state machine.
//!
//! A [`Session`] is sans-IO: it consumes raw datagrams and clock ticks and
//! produces datagrams to send ([`Session::poll_transmit`]) and events for its
//! owner ([`Session::poll_event`]). The worker task that owns it does all the
//! awaiting; nothing in here blocks or touches a socket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::{NetworkConfig, PROTOCOL_VERSION};
use crate::core::packet::{KeepAlive, Packet};
use crate::core::schema::PacketRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{self, ServerHandshake};
use crate::protocol::pipeline::BatchPipeline;
use crate::protocol::state::{DisconnectReason, SessionId, SessionState};
use crate::reliability::datagram::Reliability;
use crate::reliability::ReliabilityLayer;
use crate::utils::compression::CompressionKind;
use crate::utils::metrics::Metrics;
use crate::utils::replay_cache::ReplayCache;

/// Server-wide collaborators shared by every session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub config: Arc<NetworkConfig>,
    pub registry: PacketRegistry,
    pub replay_cache: Arc<Mutex<ReplayCache>>,
    pub metrics: Arc<Metrics>,
}

impl SessionContext {
    pub fn new(config: NetworkConfig, registry: PacketRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            replay_cache: Arc::new(Mutex::new(ReplayCache::new())),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Something the owner of a session has to act on
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A game packet for the sink
    Deliver(Packet),
    /// Compression is negotiated; ask the sink for the spawn snapshot and
    /// answer with [`Session::complete_spawn`]
    SpawnRequested,
    /// The session reached `Closed`; emitted exactly once
    Closed(DisconnectReason),
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: SessionState,
    ctx: SessionContext,
    reliability: ReliabilityLayer,
    pipeline: BatchPipeline,
    handshake: Option<ServerHandshake>,
    created_at: Instant,
    last_activity: Instant,
    last_keepalive_sent: Instant,
    last_keepalive_received: Instant,
    next_ping_id: u64,
    violations: u32,
    close_reason: Option<DisconnectReason>,
    events: VecDeque<SessionEvent>,
}

impl Session {
    pub fn new(id: SessionId, peer: SocketAddr, ctx: SessionContext, now: Instant) -> Self {
        let config = &ctx.config;
        let reliability = ReliabilityLayer::new(&config.reliability);
        let pipeline = BatchPipeline::new(
            ctx.registry.clone(),
            &config.transport,
            config.session.max_packets_per_batch,
        );
        Self {
            id,
            peer,
            state: SessionState::Handshaking,
            ctx,
            reliability,
            pipeline,
            handshake: None,
            created_at: now,
            last_activity: now,
            last_keepalive_sent: now,
            last_keepalive_received: now,
            next_ping_id: 0,
            violations: 0,
            close_reason: None,
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn compression(&self) -> Option<CompressionKind> {
        self.pipeline.compression()
    }

    pub fn is_encrypted(&self) -> bool {
        self.pipeline.is_encrypted()
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.reliability.poll_transmit()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Feed one datagram from the peer
    pub fn handle_datagram(&mut self, raw: Bytes, now: Instant) {
        if self.is_closed() {
            return;
        }
        let received = match self.reliability.handle_datagram(raw, now) {
            Ok(received) => received,
            Err(e) if e.is_fatal() => return self.fail(e, now),
            Err(e) => return self.violation(e, now),
        };
        self.last_activity = now;

        for e in received.errors {
            self.violation(e, now);
        }
        for payload in received.payloads {
            if self.is_closed() {
                return;
            }
            self.handle_payload(&payload, now);
        }
    }

    fn handle_payload(&mut self, payload: &[u8], now: Instant) {
        let results = match self.pipeline.decode(payload) {
            Ok(results) => results,
            Err(e) => return self.fail(e, now),
        };
        for result in results {
            if self.is_closed() {
                return;
            }
            match result {
                Ok(packet) => self.handle_packet(packet, now),
                Err(e) => self.violation(e, now),
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) {
        trace!(session_id = self.id, packet = packet.name(), state = %self.state, "Packet received");

        match (self.state, packet) {
            (_, Packet::Disconnect { reason, message }) => {
                debug!(session_id = self.id, remote_reason = %reason, %message, "Peer disconnected");
                self.close(DisconnectReason::ClientDisconnect, false, now);
            }

            (SessionState::Handshaking, Packet::ConnectionRequest(request)) => {
                if request.protocol_version != PROTOCOL_VERSION {
                    info!(
                        peer = %self.peer,
                        client_version = request.protocol_version,
                        server_version = PROTOCOL_VERSION,
                        "Rejected connection attempt with incompatible version"
                    );
                    self.ctx.metrics.handshake_rejected();
                    let notice = Packet::IncompatibleVersion {
                        server_version: PROTOCOL_VERSION,
                    };
                    if let Err(e) = self.send_packets(&[notice], now) {
                        debug!(peer = %self.peer, error = %e, "Version rejection not sent");
                    }
                    self.close(DisconnectReason::IncompatibleVersion, false, now);
                    return;
                }

                let response = match self.ctx.replay_cache.lock() {
                    Ok(mut cache) => handshake::server_respond(&request, self.peer, &mut cache),
                    Err(_) => Err(ProtocolError::Custom(
                        crate::error::constants::ERR_REPLAY_CACHE_LOCK.into(),
                    )),
                };
                match response {
                    Ok((state, response)) => {
                        self.handshake = Some(state);
                        if let Err(e) = self.send_packets(&[Packet::HandshakeResponse(response)], now) {
                            return self.fail(e, now);
                        }
                        self.transition(SessionState::KeyExchange);
                    }
                    Err(e) => self.fail(e, now),
                }
            }

            (SessionState::KeyExchange, Packet::HandshakeConfirm { nonce_verification }) => {
                let Some(state) = self.handshake.take() else {
                    return self.fail(
                        ProtocolError::HandshakeFailed(
                            crate::error::constants::ERR_SERVER_SECRET_NOT_FOUND.into(),
                        ),
                        now,
                    );
                };
                match state.finalize(nonce_verification) {
                    Ok(keys) => {
                        self.pipeline.enable_encryption(keys);
                        self.transition(SessionState::CompressionNegotiated);
                    }
                    Err(e) => self.fail(e, now),
                }
            }

            (SessionState::CompressionNegotiated, Packet::CompressionRequest { algorithms }) => {
                let transport = &self.ctx.config.transport;
                let selected = if transport.compression_enabled {
                    transport
                        .compression_preference
                        .iter()
                        .copied()
                        .find(|kind| algorithms.contains(kind))
                } else {
                    None
                };
                let threshold = transport.compression_threshold_bytes;

                if let Err(e) = self.send_packets(
                    &[Packet::CompressionSelected {
                        algorithm: selected,
                        threshold,
                    }],
                    now,
                ) {
                    return self.fail(e, now);
                }
                if let Some(kind) = selected {
                    self.pipeline.enable_compression(kind, threshold as usize);
                }
                debug!(session_id = self.id, compression = ?selected, "Compression negotiated");
                self.transition(SessionState::Spawning);
                self.events.push_back(SessionEvent::SpawnRequested);
            }

            (SessionState::Spawning | SessionState::Active, Packet::KeepAlive(keep_alive)) => {
                self.last_keepalive_received = now;
                if !keep_alive.response {
                    let echo = Packet::KeepAlive(KeepAlive {
                        ping_id: keep_alive.ping_id,
                        response: true,
                    });
                    if let Err(e) = self.send_packets(&[echo], now) {
                        self.fail(e, now);
                    }
                }
            }

            (SessionState::Active, Packet::Game(game)) => {
                self.ctx.metrics.packet_delivered();
                self.events.push_back(SessionEvent::Deliver(Packet::Game(game)));
            }

            (state, packet) => {
                self.violation(
                    ProtocolError::UnexpectedPacket {
                        id: packet.id(),
                        state: state.name(),
                    },
                    now,
                );
            }
        }
    }

    /// Finish spawning with the sink's snapshot (or its failure)
    pub fn complete_spawn(&mut self, snapshot: Result<Vec<Packet>>, now: Instant) {
        if self.state != SessionState::Spawning {
            return;
        }
        let mut packets = match snapshot {
            Ok(packets) => packets,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "Spawn failed");
                return self.close(DisconnectReason::SpawnFailed, true, now);
            }
        };
        packets.push(Packet::SpawnComplete {
            session_id: self.id,
        });
        if let Err(e) = self.send_packets(&packets, now) {
            warn!(session_id = self.id, error = %e, "Spawn snapshot could not be encoded");
            return self.close(DisconnectReason::SpawnFailed, true, now);
        }
        self.last_keepalive_sent = now;
        self.last_keepalive_received = now;
        self.transition(SessionState::Active);
        info!(session_id = self.id, peer = %self.peer, "Session active");
    }

    /// Send packets on behalf of the game logic
    pub fn send(&mut self, packets: &[Packet], now: Instant) -> Result<()> {
        match self.state {
            SessionState::Spawning | SessionState::Active => self.send_packets(packets, now),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn send_packets(&mut self, packets: &[Packet], now: Instant) -> Result<()> {
        let payload = self.pipeline.encode(packets)?;
        self.reliability.send(payload, Reliability::ReliableOrdered, 0)?;
        self.reliability.flush(now);
        Ok(())
    }

    /// Periodic work: handshake deadline, retransmission, ACK flush and
    /// keepalives
    pub fn tick(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }

        let config = &self.ctx.config;
        if self.state.is_negotiating()
            && now.saturating_duration_since(self.created_at) >= config.server.handshake_timeout
        {
            warn!(session_id = self.id, state = %self.state, "Handshake timed out");
            self.ctx.metrics.handshake_failed();
            return self.close(DisconnectReason::HandshakeFailed, true, now);
        }

        if self.state == SessionState::Active {
            let keepalive_timeout = config.session.keepalive_timeout;
            let keepalive_interval = config.session.keepalive_interval;
            if now.saturating_duration_since(self.last_keepalive_received) >= keepalive_timeout {
                info!(session_id = self.id, "Keepalive timeout");
                return self.disconnect(DisconnectReason::KeepAliveTimeout, now);
            }
            if now.saturating_duration_since(self.last_keepalive_sent) >= keepalive_interval {
                let ping = Packet::KeepAlive(KeepAlive {
                    ping_id: self.next_ping_id,
                    response: false,
                });
                self.next_ping_id += 1;
                self.last_keepalive_sent = now;
                if let Err(e) = self.send_packets(&[ping], now) {
                    return self.fail(e, now);
                }
            }
        }

        if let Err(e) = self.reliability.tick(now) {
            return self.fail(e, now);
        }

        let stats = self.reliability.take_stats();
        let metrics = &self.ctx.metrics;
        metrics.retransmitted(stats.retransmissions);
        for _ in 0..stats.acks_received {
            metrics.ack_received();
        }
        for _ in 0..stats.naks_received {
            metrics.nak_received();
        }
    }

    /// Orderly shutdown: flush ACKs, send a `Disconnect` notice, close
    pub fn disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        self.close(reason, true, now);
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    fn violation(&mut self, err: ProtocolError, now: Instant) {
        self.violations += 1;
        self.ctx.metrics.protocol_violation();
        debug!(
            session_id = self.id,
            violations = self.violations,
            error = %err,
            "Dropped packet"
        );
        if self.violations > self.ctx.config.session.max_violations {
            warn!(session_id = self.id, peer = %self.peer, "Too many protocol violations");
            self.close(DisconnectReason::ProtocolViolation, true, now);
        }
    }

    fn fail(&mut self, err: ProtocolError, now: Instant) {
        let reason = DisconnectReason::for_error(&err);
        warn!(session_id = self.id, peer = %self.peer, error = %err, %reason, "Session failed");
        if matches!(reason, DisconnectReason::HandshakeFailed) {
            self.ctx.metrics.handshake_failed();
        }
        // a peer that stopped acknowledging will not read a notice either
        let notify = !matches!(reason, DisconnectReason::RetransmissionExceeded);
        self.close(reason, notify, now);
    }

    fn close(&mut self, reason: DisconnectReason, notify: bool, now: Instant) {
        if self.is_closed() {
            return;
        }
        self.transition(SessionState::Disconnecting);
        self.reliability.flush_acks();
        if notify {
            let notice = Packet::Disconnect {
                reason,
                message: reason.description().to_string(),
            };
            if let Err(e) = self.send_packets(&[notice], now) {
                debug!(session_id = self.id, error = %e, "Disconnect notice not sent");
            }
        }
        self.close_reason = Some(reason);
        self.transition(SessionState::Closed);
        self.events.push_back(SessionEvent::Closed(reason));
    }
}
