//! Decoded packets.
//!
//! [`Packet`] is a tagged union: the session-level packets the engine itself
//! speaks have typed variants, everything else is a [`GamePacket`] whose body
//! is produced by the [`PacketRegistry`].
//!
//! ## Session packet ids
//! ```text
//! 0x01 ConnectionRequest     client -> server  plaintext
//! 0x02 IncompatibleVersion   server -> client  plaintext
//! 0x03 HandshakeResponse     server -> client  plaintext
//! 0x04 HandshakeConfirm      client -> server  plaintext
//! 0x05 CompressionRequest    client -> server  encrypted
//! 0x06 CompressionSelected   server -> client  encrypted
//! 0x07 SpawnComplete         server -> client
//! 0x08 KeepAlive             both
//! 0x09 Disconnect            both
//! ```
//! Ids up to [`MAX_BUILTIN_ID`] are reserved.

use bytes::Bytes;

use crate::core::binary::{PacketReader, PacketWriter};
use crate::core::schema::{Fields, PacketRegistry};
use crate::error::{ProtocolError, Result};
use crate::protocol::state::DisconnectReason;
use crate::utils::compression::CompressionKind;

pub const ID_CONNECTION_REQUEST: u32 = 0x01;
pub const ID_INCOMPATIBLE_VERSION: u32 = 0x02;
pub const ID_HANDSHAKE_RESPONSE: u32 = 0x03;
pub const ID_HANDSHAKE_CONFIRM: u32 = 0x04;
pub const ID_COMPRESSION_REQUEST: u32 = 0x05;
pub const ID_COMPRESSION_SELECTED: u32 = 0x06;
pub const ID_SPAWN_COMPLETE: u32 = 0x07;
pub const ID_KEEP_ALIVE: u32 = 0x08;
pub const ID_DISCONNECT: u32 = 0x09;

/// Highest id reserved for session packets
pub const MAX_BUILTIN_ID: u32 = 0x0F;

/// Longest disconnect message accepted from a peer
const MAX_DISCONNECT_MESSAGE: usize = 512;

pub fn is_builtin_id(id: u32) -> bool {
    id <= MAX_BUILTIN_ID
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub protocol_version: u32,
    pub pub_key: [u8; 32],
    pub nonce: [u8; 16],
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub pub_key: [u8; 32],
    pub nonce: [u8; 16],
    pub nonce_verification: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlive {
    pub ping_id: u64,
    /// `true` when echoing a peer's keepalive
    pub response: bool,
}

/// A packet from the game's own schema
#[derive(Debug, Clone, PartialEq)]
pub struct GamePacket {
    pub id: u32,
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ConnectionRequest(ConnectionRequest),
    IncompatibleVersion { server_version: u32 },
    HandshakeResponse(HandshakeResponse),
    HandshakeConfirm { nonce_verification: [u8; 32] },
    CompressionRequest { algorithms: Vec<CompressionKind> },
    CompressionSelected {
        algorithm: Option<CompressionKind>,
        threshold: u16,
    },
    SpawnComplete { session_id: u64 },
    KeepAlive(KeepAlive),
    Disconnect {
        reason: DisconnectReason,
        message: String,
    },
    Game(GamePacket),
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::ConnectionRequest(_) => ID_CONNECTION_REQUEST,
            Packet::IncompatibleVersion { .. } => ID_INCOMPATIBLE_VERSION,
            Packet::HandshakeResponse(_) => ID_HANDSHAKE_RESPONSE,
            Packet::HandshakeConfirm { .. } => ID_HANDSHAKE_CONFIRM,
            Packet::CompressionRequest { .. } => ID_COMPRESSION_REQUEST,
            Packet::CompressionSelected { .. } => ID_COMPRESSION_SELECTED,
            Packet::SpawnComplete { .. } => ID_SPAWN_COMPLETE,
            Packet::KeepAlive(_) => ID_KEEP_ALIVE,
            Packet::Disconnect { .. } => ID_DISCONNECT,
            Packet::Game(game) => game.id,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ConnectionRequest(_) => "ConnectionRequest",
            Packet::IncompatibleVersion { .. } => "IncompatibleVersion",
            Packet::HandshakeResponse(_) => "HandshakeResponse",
            Packet::HandshakeConfirm { .. } => "HandshakeConfirm",
            Packet::CompressionRequest { .. } => "CompressionRequest",
            Packet::CompressionSelected { .. } => "CompressionSelected",
            Packet::SpawnComplete { .. } => "SpawnComplete",
            Packet::KeepAlive(_) => "KeepAlive",
            Packet::Disconnect { .. } => "Disconnect",
            Packet::Game(_) => "Game",
        }
    }

    pub fn game(id: u32, fields: Fields) -> Self {
        Packet::Game(GamePacket { id, fields })
    }

    /// Decode a body for `id`. The body must be consumed exactly.
    pub fn decode(id: u32, body: &[u8], registry: &PacketRegistry) -> Result<Packet> {
        if !is_builtin_id(id) {
            let fields = registry.decode(id, body)?;
            return Ok(Packet::game(id, fields));
        }

        let mut r = PacketReader::new(body);
        let packet = match id {
            ID_CONNECTION_REQUEST => Packet::ConnectionRequest(ConnectionRequest {
                protocol_version: r.read_u32()?,
                pub_key: r.read_array()?,
                nonce: r.read_array()?,
                timestamp: r.read_u64()?,
            }),
            ID_INCOMPATIBLE_VERSION => Packet::IncompatibleVersion {
                server_version: r.read_u32()?,
            },
            ID_HANDSHAKE_RESPONSE => Packet::HandshakeResponse(HandshakeResponse {
                pub_key: r.read_array()?,
                nonce: r.read_array()?,
                nonce_verification: r.read_array()?,
            }),
            ID_HANDSHAKE_CONFIRM => Packet::HandshakeConfirm {
                nonce_verification: r.read_array()?,
            },
            ID_COMPRESSION_REQUEST => {
                let count = r.read_u8()? as usize;
                let mut algorithms = Vec::with_capacity(count);
                for _ in 0..count {
                    let raw = r.read_u8()?;
                    // unknown algorithms are skipped, the server simply cannot pick them
                    if let Some(kind) = CompressionKind::from_wire(raw) {
                        algorithms.push(kind);
                    }
                }
                Packet::CompressionRequest { algorithms }
            }
            ID_COMPRESSION_SELECTED => {
                let raw = r.read_u8()?;
                let algorithm = match raw {
                    0 => None,
                    other => Some(CompressionKind::from_wire(other).ok_or_else(|| {
                        ProtocolError::MalformedPacket(format!(
                            "unknown compression algorithm {other}"
                        ))
                    })?),
                };
                Packet::CompressionSelected {
                    algorithm,
                    threshold: r.read_u16()?,
                }
            }
            ID_SPAWN_COMPLETE => Packet::SpawnComplete {
                session_id: r.read_u64()?,
            },
            ID_KEEP_ALIVE => Packet::KeepAlive(KeepAlive {
                ping_id: r.read_u64()?,
                response: r.read_bool()?,
            }),
            ID_DISCONNECT => {
                let reason = DisconnectReason::from_code(r.read_u8()?);
                let message = r.read_string()?;
                if message.len() > MAX_DISCONNECT_MESSAGE {
                    return Err(ProtocolError::MalformedPacket(
                        "disconnect message too long".into(),
                    ));
                }
                Packet::Disconnect { reason, message }
            }
            other => {
                return Err(ProtocolError::MalformedPacket(format!(
                    "reserved packet id 0x{other:02x}"
                )))
            }
        };
        r.finish()?;
        Ok(packet)
    }

    /// Encode the body (without id or length prefix)
    pub fn encode(&self, registry: &PacketRegistry) -> Result<Bytes> {
        let mut w = PacketWriter::with_capacity(64);
        match self {
            Packet::ConnectionRequest(req) => {
                w.write_u32(req.protocol_version);
                w.write_array(&req.pub_key);
                w.write_array(&req.nonce);
                w.write_u64(req.timestamp);
            }
            Packet::IncompatibleVersion { server_version } => w.write_u32(*server_version),
            Packet::HandshakeResponse(resp) => {
                w.write_array(&resp.pub_key);
                w.write_array(&resp.nonce);
                w.write_array(&resp.nonce_verification);
            }
            Packet::HandshakeConfirm { nonce_verification } => w.write_array(nonce_verification),
            Packet::CompressionRequest { algorithms } => {
                let count = u8::try_from(algorithms.len()).map_err(|_| {
                    ProtocolError::SchemaError("too many compression algorithms".into())
                })?;
                w.write_u8(count);
                for kind in algorithms {
                    w.write_u8(kind.wire_id());
                }
            }
            Packet::CompressionSelected {
                algorithm,
                threshold,
            } => {
                w.write_u8(algorithm.map(|k| k.wire_id()).unwrap_or(0));
                w.write_u16(*threshold);
            }
            Packet::SpawnComplete { session_id } => w.write_u64(*session_id),
            Packet::KeepAlive(keep_alive) => {
                w.write_u64(keep_alive.ping_id);
                w.write_bool(keep_alive.response);
            }
            Packet::Disconnect { reason, message } => {
                w.write_u8(reason.code());
                w.write_string(message)?;
            }
            Packet::Game(game) => return registry.encode(game.id, &game.fields),
        }
        Ok(w.freeze())
    }
}
