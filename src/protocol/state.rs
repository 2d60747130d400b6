//! Session lifecycle states and disconnect reasons.

use std::fmt;

use crate::error::ProtocolError;

/// Server-assigned session identifier, unique for the lifetime of a server
pub type SessionId = u64;

/// Per-connection protocol state.
///
/// Transitions only move forward:
/// `Handshaking -> KeyExchange -> CompressionNegotiated -> Spawning -> Active
/// -> Disconnecting -> Closed`, with any state allowed to jump to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Handshaking,
    KeyExchange,
    CompressionNegotiated,
    Spawning,
    Active,
    Disconnecting,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Handshaking => "Handshaking",
            SessionState::KeyExchange => "KeyExchange",
            SessionState::CompressionNegotiated => "CompressionNegotiated",
            SessionState::Spawning => "Spawning",
            SessionState::Active => "Active",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Closed => "Closed",
        }
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether the handshake has not yet reached the play state
    pub fn is_negotiating(self) -> bool {
        self < SessionState::Active
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a session ended; carried on the wire in `Disconnect` and reported to
/// the disconnect hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    ClientDisconnect,
    ServerShutdown,
    IncompatibleVersion,
    HandshakeFailed,
    ProtocolViolation,
    DecryptionFailed,
    RetransmissionExceeded,
    KeepAliveTimeout,
    IdleTimeout,
    SpawnFailed,
    /// A code this build does not know
    Unknown(u8),
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        match self {
            DisconnectReason::ClientDisconnect => 0,
            DisconnectReason::ServerShutdown => 1,
            DisconnectReason::IncompatibleVersion => 2,
            DisconnectReason::HandshakeFailed => 3,
            DisconnectReason::ProtocolViolation => 4,
            DisconnectReason::DecryptionFailed => 5,
            DisconnectReason::RetransmissionExceeded => 6,
            DisconnectReason::KeepAliveTimeout => 7,
            DisconnectReason::IdleTimeout => 8,
            DisconnectReason::SpawnFailed => 9,
            DisconnectReason::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => DisconnectReason::ClientDisconnect,
            1 => DisconnectReason::ServerShutdown,
            2 => DisconnectReason::IncompatibleVersion,
            3 => DisconnectReason::HandshakeFailed,
            4 => DisconnectReason::ProtocolViolation,
            5 => DisconnectReason::DecryptionFailed,
            6 => DisconnectReason::RetransmissionExceeded,
            7 => DisconnectReason::KeepAliveTimeout,
            8 => DisconnectReason::IdleTimeout,
            9 => DisconnectReason::SpawnFailed,
            other => DisconnectReason::Unknown(other),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            DisconnectReason::ClientDisconnect => "client disconnected",
            DisconnectReason::ServerShutdown => "server shutting down",
            DisconnectReason::IncompatibleVersion => "incompatible protocol version",
            DisconnectReason::HandshakeFailed => "handshake failed",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::DecryptionFailed => "decryption failed",
            DisconnectReason::RetransmissionExceeded => "peer stopped acknowledging",
            DisconnectReason::KeepAliveTimeout => "keepalive timeout",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::SpawnFailed => "spawn failed",
            DisconnectReason::Unknown(_) => "unknown reason",
        }
    }

    /// Reason used when `err` forces a session down
    pub fn for_error(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::DecryptionError => DisconnectReason::DecryptionFailed,
            ProtocolError::HandshakeFailed(_) | ProtocolError::Timeout => {
                DisconnectReason::HandshakeFailed
            }
            ProtocolError::UnsupportedVersion(_) => DisconnectReason::IncompatibleVersion,
            ProtocolError::RetransmissionExceeded(_) => DisconnectReason::RetransmissionExceeded,
            ProtocolError::IdleTimeout => DisconnectReason::IdleTimeout,
            ProtocolError::SinkError(_) => DisconnectReason::SpawnFailed,
            ProtocolError::ConnectionClosed => DisconnectReason::ClientDisconnect,
            _ => DisconnectReason::ProtocolViolation,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_roundtrip() {
        for code in 0..=12u8 {
            assert_eq!(DisconnectReason::from_code(code).code(), code);
        }
        assert_eq!(DisconnectReason::from_code(42), DisconnectReason::Unknown(42));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            DisconnectReason::for_error(&ProtocolError::DecompressionError("bomb".into())),
            DisconnectReason::ProtocolViolation
        );
        assert_eq!(
            DisconnectReason::for_error(&ProtocolError::DecryptionError),
            DisconnectReason::DecryptionFailed
        );
        assert_eq!(
            DisconnectReason::for_error(&ProtocolError::RetransmissionExceeded(3)),
            DisconnectReason::RetransmissionExceeded
        );
    }

    #[test]
    fn test_state_order() {
        assert!(SessionState::Spawning.is_negotiating());
        assert!(!SessionState::Active.is_negotiating());
        assert!(SessionState::Closed.is_closed());
    }
}
