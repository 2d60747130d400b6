//! # Core Codec Components
//!
//! Binary packet handling: var-ints, bounded readers/writers, typed session
//! packets, the game schema registry and batch framing.
//!
//! ## Components
//! - **Varint**: 7-bit continuation encoding with bounded decode
//! - **Binary**: `PacketReader` / `PacketWriter` over little-endian fields
//! - **Packet**: tagged union of session packets plus schema-driven game packets
//! - **Schema**: registry of decode/encode closures per game packet id
//! - **Batch**: length-prefixed packet framing inside one reliable payload
//!
//! ## Security
//! - Var-ints longer than their type allows are rejected
//! - Length prefixes are checked against the remaining buffer before copying
//! - Bodies must be consumed exactly; trailing bytes are an error

pub mod batch;
pub mod binary;
pub mod packet;
pub mod schema;
pub mod varint;
