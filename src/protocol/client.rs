//! Client side of a session.
//!
//! [`ClientSession`] drives the same handshake from the other end: it opens
//! with a `ConnectionRequest`, answers the key exchange, asks for compression
//! and waits for `SpawnComplete`. Like the server session it does no IO; bots
//! and integration tests pump its datagrams through a socket themselves.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, PROTOCOL_VERSION};
use crate::core::packet::{KeepAlive, Packet};
use crate::core::schema::PacketRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{self, ClientHandshake};
use crate::protocol::pipeline::BatchPipeline;
use crate::protocol::state::{DisconnectReason, SessionId, SessionState};
use crate::reliability::datagram::Reliability;
use crate::reliability::ReliabilityLayer;
use crate::utils::compression::CompressionKind;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server rejected our protocol version
    Rejected { server_version: u32 },
    /// Spawn finished; the session is in play
    Connected { session_id: SessionId },
    /// A game packet from the server (spawn snapshot included)
    Packet(Packet),
    /// The session ended, either side having closed it
    Disconnected(DisconnectReason),
}

#[derive(Debug)]
pub struct ClientSession {
    state: SessionState,
    protocol_version: u32,
    algorithms: Vec<CompressionKind>,
    reliability: ReliabilityLayer,
    pipeline: BatchPipeline,
    handshake: Option<ClientHandshake>,
    session_id: Option<SessionId>,
    events: VecDeque<ClientEvent>,
}

impl ClientSession {
    pub fn new(config: &NetworkConfig, registry: PacketRegistry) -> Self {
        Self {
            state: SessionState::Handshaking,
            protocol_version: PROTOCOL_VERSION,
            algorithms: config.transport.compression_preference.clone(),
            reliability: ReliabilityLayer::new(&config.reliability),
            pipeline: BatchPipeline::new(
                registry,
                &config.transport,
                config.session.max_packets_per_batch,
            ),
            handshake: None,
            session_id: None,
            events: VecDeque::new(),
        }
    }

    /// Announce a different protocol version (for testing rejections)
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Compression algorithms offered to the server, in no particular order
    pub fn with_algorithms(mut self, algorithms: Vec<CompressionKind>) -> Self {
        self.algorithms = algorithms;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn compression(&self) -> Option<CompressionKind> {
        self.pipeline.compression()
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.reliability.poll_transmit()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// Send the opening `ConnectionRequest`
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != SessionState::Handshaking || self.handshake.is_some() {
            return Err(ProtocolError::HandshakeFailed("handshake already started".into()));
        }
        let (state, request) = handshake::client_init(self.protocol_version)?;
        self.handshake = Some(state);
        self.send_packets(&[Packet::ConnectionRequest(request)], now)
    }

    /// Send game packets once connected
    pub fn send(&mut self, packets: &[Packet], now: Instant) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.send_packets(packets, now)
    }

    /// Close the session. While compression is being negotiated the server
    /// may or may not expect a compression header yet, so no notice is sent
    /// and the server's handshake timeout ends its side.
    pub fn disconnect(&mut self, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        if self.state == SessionState::CompressionNegotiated {
            debug!("Disconnect notice withheld until compression is settled");
        } else {
            let notice = Packet::Disconnect {
                reason: DisconnectReason::ClientDisconnect,
                message: String::new(),
            };
            if let Err(e) = self.send_packets(&[notice], now) {
                debug!(error = %e, "Disconnect notice not sent");
            }
        }
        self.reliability.flush_acks();
        self.finish(DisconnectReason::ClientDisconnect);
    }

    /// Retransmission and ACK flush
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        if let Err(e) = self.reliability.tick(now) {
            self.finish(DisconnectReason::for_error(&e));
            return Err(e);
        }
        Ok(())
    }

    pub fn handle_datagram(&mut self, raw: Bytes, now: Instant) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        let received = self.reliability.handle_datagram(raw, now)?;
        for e in received.errors {
            debug!(error = %e, "Dropped frame");
        }
        for payload in received.payloads {
            if self.state.is_closed() {
                break;
            }
            let packets = match self.pipeline.decode(&payload) {
                Ok(packets) => packets,
                Err(e) => {
                    self.finish(DisconnectReason::for_error(&e));
                    return Err(e);
                }
            };
            for packet in packets {
                match packet {
                    Ok(packet) => self.handle_packet(packet, now)?,
                    Err(e) => debug!(error = %e, "Dropped packet"),
                }
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) -> Result<()> {
        match (self.state, packet) {
            (_, Packet::Disconnect { reason, message }) => {
                info!(%reason, %message, "Server closed the session");
                self.finish(reason);
            }

            (SessionState::Handshaking, Packet::IncompatibleVersion { server_version }) => {
                warn!(
                    server_version,
                    client_version = self.protocol_version,
                    "Server rejected protocol version"
                );
                self.events.push_back(ClientEvent::Rejected { server_version });
                self.finish(DisconnectReason::IncompatibleVersion);
            }

            (SessionState::Handshaking, Packet::HandshakeResponse(response)) => {
                let state = self.handshake.take().ok_or_else(|| {
                    ProtocolError::HandshakeFailed("response before request".into())
                })?;
                let (keys, confirm) = match state.verify(&response) {
                    Ok(result) => result,
                    Err(e) => {
                        self.finish(DisconnectReason::HandshakeFailed);
                        return Err(e);
                    }
                };
                self.send_packets(
                    &[Packet::HandshakeConfirm {
                        nonce_verification: confirm,
                    }],
                    now,
                )?;
                self.pipeline.enable_encryption(keys);

                let algorithms = self.algorithms.clone();
                self.send_packets(&[Packet::CompressionRequest { algorithms }], now)?;
                self.state = SessionState::CompressionNegotiated;
            }

            (
                SessionState::CompressionNegotiated,
                Packet::CompressionSelected {
                    algorithm,
                    threshold,
                },
            ) => {
                if let Some(kind) = algorithm {
                    self.pipeline.enable_compression(kind, threshold as usize);
                }
                debug!(compression = ?algorithm, "Compression selected by server");
                self.state = SessionState::Spawning;
            }

            (SessionState::Spawning, Packet::SpawnComplete { session_id }) => {
                self.session_id = Some(session_id);
                self.state = SessionState::Active;
                self.events.push_back(ClientEvent::Connected { session_id });
            }

            (SessionState::Spawning | SessionState::Active, Packet::KeepAlive(keep_alive)) => {
                if !keep_alive.response {
                    let echo = Packet::KeepAlive(KeepAlive {
                        ping_id: keep_alive.ping_id,
                        response: true,
                    });
                    self.send_packets(&[echo], now)?;
                }
            }

            (SessionState::Spawning | SessionState::Active, Packet::Game(game)) => {
                self.events.push_back(ClientEvent::Packet(Packet::Game(game)));
            }

            (state, packet) => {
                debug!(packet = packet.name(), %state, "Unexpected packet from server");
            }
        }
        Ok(())
    }

    fn send_packets(&mut self, packets: &[Packet], now: Instant) -> Result<()> {
        let payload = self.pipeline.encode(packets)?;
        self.reliability.send(payload, Reliability::ReliableOrdered, 0)?;
        self.reliability.flush(now);
        Ok(())
    }

    fn finish(&mut self, reason: DisconnectReason) {
        if self.state.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        self.events.push_back(ClientEvent::Disconnected(reason));
    }
}
