//! # blocknet
//!
//! Session engine for block-game servers over UDP.
//!
//! Each peer gets a session that walks through version check, X25519 key
//! agreement, compression negotiation and spawn before game packets flow.
//! Underneath, a reliability layer provides sequenced datagrams with ACK/NAK,
//! retransmission, fragmentation and per-channel ordering; batches of packets
//! are compressed (LZ4 or Zstd) and sealed with ChaCha20-Poly1305.
//!
//! ## Layout
//! - [`core`]: var-ints, packet types, schema registry, batch framing
//! - [`reliability`]: datagram codec, ACK ledger, reassembly and ordering
//! - [`protocol`]: handshake, codec pipeline, server and client sessions
//! - [`server`]: UDP receive loop, session registry, per-session workers
//! - [`utils`]: compression, crypto, logging, metrics, timeouts
//! - [`config`]: TOML / environment configuration with validation
//! - [`error`]: the crate-wide [`ProtocolError`]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod reliability;
pub mod server;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::{ClientEvent, ClientSession, DisconnectReason, SessionId, SessionState};
pub use server::{DisconnectHook, GameSink, PacketSender, Server, SpawnContext};
