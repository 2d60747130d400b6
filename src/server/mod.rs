//! # UDP Server
//!
//! One receive loop owns the socket. Datagrams from known peers are queued to
//! their session worker; datagrams from unknown peers run through a
//! provisional [`Session`] inline, which is registered (and gets a worker)
//! only once its handshake is accepted. A background sweep evicts idle
//! sessions.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use blocknet::config::NetworkConfig;
//! use blocknet::core::schema::PacketRegistry;
//! use blocknet::server::{LoggingSink, Server};
//!
//! # async fn run() -> blocknet::error::Result<()> {
//! let server = Server::bind(NetworkConfig::default(), PacketRegistry::new(), Arc::new(LoggingSink)).await?;
//! server.run().await
//! # }
//! ```

pub(crate) mod registry;
pub mod sink;
mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::schema::PacketRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::session::{Session, SessionContext};
use crate::protocol::state::{DisconnectReason, SessionState};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

use registry::{SessionCommand, SessionHandle, SessionRegistry};
use worker::Worker;

pub use sink::{DisconnectHook, GameSink, LoggingHook, LoggingSink, PacketSender, SpawnContext};

/// Largest datagram the receive loop accepts
const RECV_BUFFER_SIZE: usize = 64 * 1024;

pub struct Server {
    socket: Arc<UdpSocket>,
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn GameSink>,
    hook: Arc<dyn DisconnectHook>,
    cancel: CancellationToken,
    workers: TaskTracker,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("sessions", &self.registry.len())
            .finish()
    }
}

impl Server {
    /// Bind the configured address
    #[instrument(skip(config, registry, sink), fields(address = %config.server.address))]
    pub async fn bind(
        config: NetworkConfig,
        registry: PacketRegistry,
        sink: Arc<dyn GameSink>,
    ) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let socket = UdpSocket::bind(&config.server.address).await?;
        info!(local_addr = ?socket.local_addr().ok(), "Server bound");

        Ok(Self {
            socket: Arc::new(socket),
            ctx: SessionContext::new(config, registry),
            registry: Arc::new(SessionRegistry::default()),
            sink,
            hook: Arc::new(LoggingHook),
            cancel: CancellationToken::new(),
            workers: TaskTracker::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_disconnect_hook<H: DisconnectHook>(mut self, hook: H) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.ctx.metrics.clone()
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Token that stops [`Server::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.cancel.cancel();
    }

    /// Serve until shutdown, then close every session and wait for workers
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        let sweep = tokio::spawn(Self::sweep(
            self.registry.clone(),
            self.ctx.clone(),
            self.cancel.clone(),
        ));

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        self.ctx.metrics.datagram_received(len);
                        self.dispatch(peer, Bytes::copy_from_slice(&buf[..len])).await;
                    }
                    // ICMP errors surface here on some platforms; the socket stays usable
                    Err(e) => warn!(error = %e, "Receive failed"),
                },
            }
        }

        info!(sessions = self.registry.len(), "Stopping, closing sessions");
        self.workers.close();
        let drained = with_timeout_error(
            async {
                self.workers.wait().await;
                Ok(())
            },
            self.ctx.config.server.shutdown_timeout,
        )
        .await;
        if drained.is_err() {
            warn!("Shutdown timeout reached, abandoning remaining sessions");
        }
        if let Err(e) = sweep.await {
            error!(error = %e, "Idle sweep task failed");
        }
        self.ctx.metrics.log_snapshot();
        Ok(())
    }

    async fn dispatch(&self, peer: SocketAddr, datagram: Bytes) {
        match self.registry.get(&peer) {
            Ok(Some(handle)) => {
                if handle.try_deliver(datagram).is_err() {
                    trace!(%peer, session_id = handle.id(), "Session queue full, datagram dropped");
                    self.ctx.metrics.datagram_dropped();
                }
            }
            Ok(None) => self.accept(peer, datagram).await,
            Err(e) => error!(error = %e, "Registry lookup failed"),
        }
    }

    /// Run a first datagram through a provisional session; register it only
    /// once the handshake has been accepted
    async fn accept(&self, peer: SocketAddr, datagram: Bytes) {
        let config = &self.ctx.config;
        if self.registry.len() >= config.server.max_sessions {
            warn!(%peer, max_sessions = config.server.max_sessions, "Session limit reached, handshake dropped");
            self.ctx.metrics.datagram_dropped();
            return;
        }

        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(id, peer, self.ctx.clone(), now);
        session.handle_datagram(datagram, now);

        if session.state() != SessionState::KeyExchange {
            // rejected versions still get their answer
            while let Some(reply) = session.poll_transmit() {
                self.send_to(peer, &reply).await;
            }
            debug!(%peer, state = %session.state(), "Provisional session discarded");
            return;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.server.inbound_queue);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(id, inbound_tx, command_tx);
        if let Err(e) = self.registry.insert(peer, handle.clone(), now) {
            error!(%peer, error = %e, "Failed to register session");
            return;
        }
        self.ctx.metrics.session_opened();
        info!(%peer, session_id = id, "Session registered");

        let worker = Worker {
            session,
            handle,
            socket: self.socket.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            hook: self.hook.clone(),
            metrics: self.ctx.metrics.clone(),
            inbound: inbound_rx,
            commands: command_rx,
            cancel: self.cancel.child_token(),
            tick_interval: config.reliability.tick_interval,
            spawn_timeout: config.server.spawn_timeout,
        };
        self.workers.spawn(worker.run());
    }

    async fn send_to(&self, peer: SocketAddr, datagram: &[u8]) {
        match self.socket.send_to(datagram, peer).await {
            Ok(sent) => self.ctx.metrics.datagram_sent(sent),
            Err(e) => warn!(%peer, error = %e, "Failed to send datagram"),
        }
    }

    /// Evict sessions that have been silent for `idle_timeout`
    async fn sweep(registry: Arc<SessionRegistry>, ctx: SessionContext, cancel: CancellationToken) {
        let idle_timeout = ctx.config.server.idle_timeout;
        let mut interval = tokio::time::interval(ctx.config.server.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let idle = match registry.drain_idle(Instant::now(), idle_timeout) {
                Ok(idle) => idle,
                Err(e) => {
                    error!(error = %e, "Idle sweep failed");
                    continue;
                }
            };
            for (peer, handle) in idle {
                info!(%peer, session_id = handle.id(), "Evicting idle session");
                ctx.metrics.idle_eviction();
                if handle.command(SessionCommand::Close(DisconnectReason::IdleTimeout)).is_err() {
                    debug!(%peer, "Idle session already gone");
                }
            }
        }
    }
}
