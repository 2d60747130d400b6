//! # Error Types
//!
//! Error handling for the session engine.
//!
//! Every layer of the pipeline reports failures through [`ProtocolError`]. The
//! variants are grouped by how the owning session reacts to them:
//!
//! ## Error Categories
//! - **Recoverable**: `MalformedPacket`, `UnexpectedPacket` - the packet is
//!   dropped and a violation is counted against the session
//! - **Fatal to the session**: `DecompressionError`, `DecryptionError`,
//!   `HandshakeFailed`, `RetransmissionExceeded` - the session is disconnected
//!   and the failure is never retried
//! - **Lifecycle**: `IdleTimeout`, `ConnectionClosed`, `Timeout`
//! - **Local**: I/O, configuration and registry failures
//!
//! ## Example Usage
//! ```rust
//! use blocknet::core::varint;
//! use blocknet::error::ProtocolError;
//!
//! let truncated = [0x80u8, 0x80];
//! let mut slice = &truncated[..];
//! match varint::read_var_u32(&mut slice) {
//!     Err(ProtocolError::MalformedPacket(reason)) => assert!(reason.contains("var-int")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Codec errors
    pub const ERR_VARINT_TOO_LONG: &str = "var-int exceeds maximum encoded length";
    pub const ERR_VARINT_TRUNCATED: &str = "var-int truncated by end of buffer";
    pub const ERR_LENGTH_PREFIX: &str = "length prefix exceeds remaining buffer";
    pub const ERR_TRAILING_BYTES: &str = "trailing bytes after packet body";
    pub const ERR_UNEXPECTED_EOF: &str = "unexpected end of packet body";
    pub const ERR_INVALID_UTF8: &str = "string is not valid UTF-8";
    pub const ERR_UNKNOWN_PACKET: &str = "unknown packet id";
    pub const ERR_TOO_MANY_PACKETS: &str = "batch holds too many packets";

    /// Reliability layer errors
    pub const ERR_EMPTY_DATAGRAM: &str = "empty datagram";
    pub const ERR_UNKNOWN_DATAGRAM: &str = "unknown datagram kind";
    pub const ERR_BAD_FRAME: &str = "malformed frame header";
    pub const ERR_BAD_SPLIT: &str = "invalid fragment index or count";
    pub const ERR_TOO_MANY_SPLITS: &str = "too many concurrent reassemblies";
    pub const ERR_BAD_CHANNEL: &str = "ordering channel out of range";
    pub const ERR_FRAME_TOO_LARGE: &str = "batch needs more fragments than allowed";
    pub const ERR_BAD_ACK_RANGE: &str = "acknowledgment range start after end";
    pub const ERR_ORDER_BACKLOG: &str = "ordering channel backlog exceeded";

    /// Handshake-specific errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_REPLAY_ATTACK: &str = "Replay attack detected - nonce/timestamp already seen";
    pub const ERR_CLIENT_SECRET_NOT_FOUND: &str = "Client secret not found";
    pub const ERR_SERVER_SECRET_NOT_FOUND: &str = "Server secret not found";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "Server failed to verify client nonce";
    pub const ERR_SERVER_VERIFICATION_FAILED: &str = "Client failed to verify server nonce";

    /// Registry errors
    pub const ERR_REGISTRY_LOCK: &str = "Session registry lock poisoned";
    pub const ERR_SCHEMA_LOCK: &str = "Packet registry lock poisoned";
    pub const ERR_REPLAY_CACHE_LOCK: &str = "Replay cache lock poisoned";
}

/// Primary error type for all session engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected packet 0x{id:02x} in state {state}")]
    UnexpectedPacket { id: u32, state: &'static str },

    #[error("Decompression failed: {0}")]
    DecompressionError(String),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decryption failed")]
    DecryptionError,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Retransmission attempts exceeded for datagram {0}")]
    RetransmissionExceeded(u32),

    #[error("Session idle timeout")]
    IdleTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Game sink error: {0}")]
    SinkError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: &str) -> Self {
        ProtocolError::MalformedPacket(reason.to_string())
    }

    /// Whether the owning session must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::DecompressionError(_)
                | ProtocolError::DecryptionError
                | ProtocolError::HandshakeFailed(_)
                | ProtocolError::RetransmissionExceeded(_)
                | ProtocolError::IdleTimeout
                | ProtocolError::ConnectionClosed
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
