//! Per-session worker task.
//!
//! The worker is the single owner of a [`Session`]. Everything that can change
//! the session (datagrams, game-logic commands, clock ticks, server shutdown)
//! is serialized through its `select!` loop, and everything the session wants
//! done (datagrams out, packets for the sink, spawn requests) is drained after
//! each step.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::protocol::session::{Session, SessionEvent};
use crate::protocol::state::DisconnectReason;
use crate::server::registry::{SessionCommand, SessionHandle, SessionRegistry};
use crate::server::sink::{DisconnectHook, GameSink, PacketSender, SpawnContext};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

pub(crate) struct Worker {
    pub(crate) session: Session,
    pub(crate) handle: SessionHandle,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) sink: Arc<dyn GameSink>,
    pub(crate) hook: Arc<dyn DisconnectHook>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) inbound: mpsc::Receiver<Bytes>,
    pub(crate) commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tick_interval: Duration,
    pub(crate) spawn_timeout: Duration,
}

impl Worker {
    #[instrument(name = "session", skip(self), fields(session_id = self.session.id(), peer = %self.session.peer()))]
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // the provisional session may already have queued events
        self.drain().await;

        while !self.session.is_closed() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.session.disconnect(DisconnectReason::ServerShutdown, Instant::now());
                }
                Some(datagram) = self.inbound.recv() => {
                    self.session.handle_datagram(datagram, Instant::now());
                    self.registry.touch(&self.handle, self.session.last_activity());
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = tick.tick() => self.session.tick(Instant::now()),
            }
            self.drain().await;
        }

        self.finish();
    }

    fn handle_command(&mut self, command: SessionCommand) {
        let now = Instant::now();
        match command {
            SessionCommand::Send(packets) => {
                if let Err(e) = self.session.send(&packets, now) {
                    debug!(error = %e, "Game packets not sent");
                }
            }
            SessionCommand::Close(reason) => self.session.disconnect(reason, now),
            SessionCommand::Spawned(snapshot) => self.session.complete_spawn(snapshot, now),
        }
    }

    /// Send queued datagrams and act on queued events
    async fn drain(&mut self) {
        let peer = self.session.peer();
        while let Some(datagram) = self.session.poll_transmit() {
            self.send_to(peer, &datagram).await;
        }

        while let Some(event) = self.session.poll_event() {
            match event {
                SessionEvent::Deliver(packet) => self.sink.deliver(self.session.id(), packet),
                SessionEvent::SpawnRequested => self.request_spawn(),
                SessionEvent::Closed(reason) => debug!(%reason, "Session closed"),
            }
        }
    }

    async fn send_to(&self, peer: SocketAddr, datagram: &[u8]) {
        match self.socket.send_to(datagram, peer).await {
            Ok(sent) => self.metrics.datagram_sent(sent),
            Err(e) => warn!(error = %e, "Failed to send datagram"),
        }
    }

    /// Ask the sink for a snapshot off the worker loop; the answer comes back
    /// as a command
    fn request_spawn(&self) {
        let ctx = SpawnContext {
            session_id: self.session.id(),
            peer: self.session.peer(),
            sender: PacketSender::new(self.session.id(), self.handle.commands()),
        };
        let future = self.sink.spawn(ctx);
        let timeout = self.spawn_timeout;
        let commands = self.handle.commands();
        tokio::spawn(async move {
            let snapshot = with_timeout_error(future, timeout).await;
            // a closed channel means the session ended while spawning
            let _ = commands.send(SessionCommand::Spawned(snapshot));
        });
    }

    fn finish(self) {
        let id = self.session.id();
        let peer = self.session.peer();
        if let Err(e) = self.registry.remove_if(&peer, id) {
            warn!(error = %e, "Failed to remove session from registry");
        }
        let reason = self
            .session
            .close_reason()
            .unwrap_or(DisconnectReason::Unknown(u8::MAX));
        self.metrics.session_closed();
        self.hook.on_disconnect(id, peer, reason);
        info!(%reason, "Session ended");
    }
}
