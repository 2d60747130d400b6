//! # Session Registry
//!
//! Address-indexed table of live sessions. The table is split into shards,
//! each behind its own `RwLock`, so the receive loop's lookups rarely contend
//! with workers removing themselves or the idle sweep.
//!
//! The registry never owns a [`Session`](crate::protocol::Session); it holds a
//! [`SessionHandle`] with the channels into the worker task that does.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::state::{DisconnectReason, SessionId};

const DEFAULT_SHARDS: usize = 16;

/// Work handed to a session worker from outside its datagram stream
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Packets pushed by game logic
    Send(Vec<Packet>),
    /// Close with the given reason (idle sweep, game logic)
    Close(DisconnectReason),
    /// The game sink's answer to a spawn request
    Spawned(Result<Vec<Packet>>),
}

/// Channels into one session worker
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    id: SessionId,
    inbound: mpsc::Sender<Bytes>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Milliseconds since the registry epoch of the last accepted datagram
    last_activity: Arc<AtomicU64>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        inbound: mpsc::Sender<Bytes>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            id,
            inbound,
            commands,
            last_activity: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a datagram without waiting. A full queue drops it, as the
    /// network would.
    pub(crate) fn try_deliver(&self, datagram: Bytes) -> std::result::Result<(), Bytes> {
        self.inbound.try_send(datagram).map_err(|e| match e {
            mpsc::error::TrySendError::Full(d) | mpsc::error::TrySendError::Closed(d) => d,
        })
    }

    pub(crate) fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub(crate) fn commands(&self) -> mpsc::UnboundedSender<SessionCommand> {
        self.commands.clone()
    }
}

#[derive(Debug)]
pub(crate) struct SessionRegistry {
    shards: Vec<RwLock<HashMap<SocketAddr, SessionHandle>>>,
    epoch: Instant,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl SessionRegistry {
    pub(crate) fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            epoch: Instant::now(),
        }
    }

    fn shard(&self, addr: &SocketAddr) -> &RwLock<HashMap<SocketAddr, SessionHandle>> {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn lock_error() -> ProtocolError {
        ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.into())
    }

    /// Register a session, replacing whatever held the address before
    pub(crate) fn insert(&self, addr: SocketAddr, handle: SessionHandle, now: Instant) -> Result<()> {
        self.touch(&handle, now);
        let mut shard = self.shard(&addr).write().map_err(|_| Self::lock_error())?;
        shard.insert(addr, handle);
        Ok(())
    }

    pub(crate) fn get(&self, addr: &SocketAddr) -> Result<Option<SessionHandle>> {
        let shard = self.shard(addr).read().map_err(|_| Self::lock_error())?;
        Ok(shard.get(addr).cloned())
    }

    /// Remove `addr` only while it still belongs to session `id`
    pub(crate) fn remove_if(&self, addr: &SocketAddr, id: SessionId) -> Result<bool> {
        let mut shard = self.shard(addr).write().map_err(|_| Self::lock_error())?;
        if shard.get(addr).is_some_and(|h| h.id == id) {
            shard.remove(addr);
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().map(|m| m.len()).unwrap_or(0))
            .sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record activity for `handle` at `now`
    pub(crate) fn touch(&self, handle: &SessionHandle, now: Instant) {
        let millis = now.saturating_duration_since(self.epoch).as_millis() as u64;
        handle.last_activity.fetch_max(millis, Ordering::Relaxed);
    }

    /// Remove and return every session silent for at least `idle_timeout`
    pub(crate) fn drain_idle(
        &self,
        now: Instant,
        idle_timeout: Duration,
    ) -> Result<Vec<(SocketAddr, SessionHandle)>> {
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        let limit = idle_timeout.as_millis() as u64;
        let mut idle = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write().map_err(|_| Self::lock_error())?;
            let expired: Vec<SocketAddr> = shard
                .iter()
                .filter(|(_, h)| {
                    now_ms.saturating_sub(h.last_activity.load(Ordering::Relaxed)) >= limit
                })
                .map(|(addr, _)| *addr)
                .collect();
            for addr in expired {
                if let Some(handle) = shard.remove(&addr) {
                    trace!(%addr, session_id = handle.id, "Idle session removed");
                    idle.push((addr, handle));
                }
            }
        }
        Ok(idle)
    }
}
