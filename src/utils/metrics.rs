//! Session engine counters.
//!
//! One [`Metrics`] instance is shared by the server loop and every session
//! worker through an `Arc`. All counters are relaxed atomics; a snapshot is
//! not a consistent cut, only a cheap view for logs and dashboards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    pub sessions_opened: AtomicU64,
    pub sessions_active: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub handshakes_rejected: AtomicU64,
    pub handshakes_failed: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub retransmissions: AtomicU64,
    pub acks_received: AtomicU64,
    pub naks_received: AtomicU64,
    pub packets_delivered: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub idle_evictions: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            handshakes_rejected: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            naks_received: AtomicU64::new(0),
            packets_delivered: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            idle_evictions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        Self::bump(&self.sessions_opened, 1);
        Self::bump(&self.sessions_active, 1);
    }

    pub fn session_closed(&self) {
        Self::bump(&self.sessions_closed, 1);
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_rejected(&self) {
        Self::bump(&self.handshakes_rejected, 1);
    }

    pub fn handshake_failed(&self) {
        Self::bump(&self.handshakes_failed, 1);
    }

    pub fn datagram_received(&self, bytes: usize) {
        Self::bump(&self.datagrams_received, 1);
        Self::bump(&self.bytes_received, bytes as u64);
    }

    pub fn datagram_sent(&self, bytes: usize) {
        Self::bump(&self.datagrams_sent, 1);
        Self::bump(&self.bytes_sent, bytes as u64);
    }

    pub fn datagram_dropped(&self) {
        Self::bump(&self.datagrams_dropped, 1);
    }

    pub fn retransmitted(&self, count: u64) {
        Self::bump(&self.retransmissions, count);
    }

    pub fn ack_received(&self) {
        Self::bump(&self.acks_received, 1);
    }

    pub fn nak_received(&self) {
        Self::bump(&self.naks_received, 1);
    }

    pub fn packet_delivered(&self) {
        Self::bump(&self.packets_delivered, 1);
    }

    pub fn protocol_violation(&self) {
        Self::bump(&self.protocol_violations, 1);
    }

    pub fn idle_eviction(&self) {
        Self::bump(&self.idle_evictions, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            naks_received: self.naks_received.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            idle_evictions: self.idle_evictions.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log the current snapshot at info level
    pub fn log_snapshot(&self) {
        let s = self.snapshot();
        info!(
            sessions_active = s.sessions_active,
            sessions_opened = s.sessions_opened,
            sessions_closed = s.sessions_closed,
            handshakes_rejected = s.handshakes_rejected,
            datagrams_received = s.datagrams_received,
            datagrams_sent = s.datagrams_sent,
            retransmissions = s.retransmissions,
            protocol_violations = s.protocol_violations,
            uptime_seconds = s.uptime_seconds,
            "Session engine metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub handshakes_rejected: u64,
    pub handshakes_failed: u64,
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    pub naks_received: u64,
    pub packets_delivered: u64,
    pub protocol_violations: u64,
    pub idle_evictions: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle_counters() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();
        metrics.datagram_sent(100);
        metrics.datagram_sent(20);

        let s = metrics.snapshot();
        assert_eq!(s.sessions_opened, 2);
        assert_eq!(s.sessions_active, 1);
        assert_eq!(s.sessions_closed, 1);
        assert_eq!(s.datagrams_sent, 2);
        assert_eq!(s.bytes_sent, 120);
    }
}
