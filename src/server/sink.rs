//! Game-logic collaborators.
//!
//! The engine knows nothing about worlds or players. A [`GameSink`] supplies
//! the spawn snapshot and receives decoded game packets; a
//! [`DisconnectHook`] hears about every registered session that ends.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::state::{DisconnectReason, SessionId};
use crate::server::registry::SessionCommand;

/// Push packets to one session from game logic
#[derive(Debug, Clone)]
pub struct PacketSender {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl PacketSender {
    pub(crate) fn new(session_id: SessionId, commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self {
            session_id,
            commands,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queue packets for the session's next batch
    pub fn send(&self, packets: Vec<Packet>) -> Result<()> {
        self.commands
            .send(SessionCommand::Send(packets))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Ask the session to disconnect the peer
    pub fn close(&self, reason: DisconnectReason) -> Result<()> {
        self.commands
            .send(SessionCommand::Close(reason))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// What game logic learns about a session that is spawning
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub session_id: SessionId,
    pub peer: SocketAddr,
    pub sender: PacketSender,
}

pub trait GameSink: Send + Sync + 'static {
    /// Build the initial world snapshot. Must finish within the configured
    /// spawn timeout or the session closes with `SpawnFailed`.
    fn spawn(&self, ctx: SpawnContext) -> BoxFuture<'static, Result<Vec<Packet>>>;

    /// A game packet arrived from an active session
    fn deliver(&self, session_id: SessionId, packet: Packet);
}

/// Called exactly once for every registered session that closes
pub trait DisconnectHook: Send + Sync + 'static {
    fn on_disconnect(&self, session_id: SessionId, peer: SocketAddr, reason: DisconnectReason);
}

impl<F> DisconnectHook for F
where
    F: Fn(SessionId, SocketAddr, DisconnectReason) + Send + Sync + 'static,
{
    fn on_disconnect(&self, session_id: SessionId, peer: SocketAddr, reason: DisconnectReason) {
        self(session_id, peer, reason)
    }
}

/// Sink that spawns into an empty world and logs what it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl GameSink for LoggingSink {
    fn spawn(&self, ctx: SpawnContext) -> BoxFuture<'static, Result<Vec<Packet>>> {
        info!(session_id = ctx.session_id, peer = %ctx.peer, "Spawning player");
        Box::pin(async { Ok(Vec::new()) })
    }

    fn deliver(&self, session_id: SessionId, packet: Packet) {
        debug!(session_id, packet = packet.name(), id = packet.id(), "Game packet");
    }
}

/// Hook that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl DisconnectHook for LoggingHook {
    fn on_disconnect(&self, session_id: SessionId, peer: SocketAddr, reason: DisconnectReason) {
        info!(session_id, %peer, %reason, "Session disconnected");
    }
}
