//! # Session Protocol
//!
//! Per-connection protocol state machine and the codec pipeline it drives.
//!
//! ## Components
//! - **State**: lifecycle states and disconnect reasons
//! - **Handshake**: X25519 key agreement with replay protection
//! - **Pipeline**: batch framing, compression and encryption
//! - **Session**: the server-side state machine
//! - **Client**: the client-side counterpart

pub mod client;
pub mod handshake;
pub mod pipeline;
pub mod session;
pub mod state;

#[cfg(test)]
mod tests;

pub use client::{ClientEvent, ClientSession};
pub use session::{Session, SessionContext, SessionEvent};
pub use state::{DisconnectReason, SessionId, SessionState};
