//! # Reliability Layer
//!
//! Reliable, ordered delivery of byte payloads over unreliable datagrams.
//!
//! ## Outbound
//! [`ReliabilityLayer::send`] turns one payload into frames (splitting it
//! when it does not fit the MTU), [`ReliabilityLayer::flush`] packs queued
//! frames into sequenced datagrams and records them in the ledger.
//!
//! ## Inbound
//! [`ReliabilityLayer::handle_datagram`] drops duplicates, processes ACKs and
//! NAKs, reassembles fragments and releases payloads in channel order. A
//! datagram is only acknowledged once its frames have been buffered; one that
//! would overflow the reassembly or ordering limits is left for the sender to
//! retransmit.
//!
//! ## Timers
//! [`ReliabilityLayer::tick`] resends expired datagrams and emits the pending
//! ACK and NAK datagrams. Everything to send ends up in an outbox drained with
//! [`ReliabilityLayer::poll_transmit`]; the layer never touches a socket.

pub mod datagram;
pub mod ledger;
pub mod reassembly;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::ReliabilityConfig;
use crate::error::{constants, ProtocolError, Result};
use datagram::{
    Datagram, Frame, OrderInfo, Reliability, SplitInfo, ACK_HEADER_LEN,
    ACK_RANGE_MAX_LEN, DATA_HEADER_LEN, MAX_CHANNELS,
};
use ledger::{AckLedger, RtoEstimator};
use reassembly::{Admission, OrderingChannels, ReceiveWindow, SplitAssembler};

/// Counters accumulated since the last [`ReliabilityLayer::take_stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReliabilityStats {
    pub retransmissions: u64,
    pub acks_received: u64,
    pub naks_received: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    /// Fresh datagrams refused because reassembly or ordering was full
    pub deferred: u64,
}

/// Result of processing one inbound datagram
#[derive(Debug, Default)]
pub struct Received {
    /// Payloads released to the layer above, in delivery order
    pub payloads: Vec<Bytes>,
    /// Frame-level problems; the offending frames were skipped
    pub errors: Vec<ProtocolError>,
}

#[derive(Debug)]
pub struct ReliabilityLayer {
    mtu: usize,
    next_seq: u32,
    next_split_id: u16,
    next_order: [u32; MAX_CHANNELS as usize],
    max_split_parts: u32,
    pending: Vec<Frame>,
    ledger: AckLedger,
    window: ReceiveWindow,
    splits: SplitAssembler,
    ordering: OrderingChannels,
    outbox: VecDeque<Bytes>,
    stats: ReliabilityStats,
}

impl ReliabilityLayer {
    pub fn new(config: &ReliabilityConfig) -> Self {
        let estimator = RtoEstimator::new(config.initial_rto, config.min_rto, config.max_rto);
        Self {
            mtu: config.mtu,
            next_seq: 0,
            next_split_id: 0,
            next_order: [0; MAX_CHANNELS as usize],
            max_split_parts: config.max_split_parts,
            pending: Vec::new(),
            ledger: AckLedger::new(estimator, config.max_retransmissions),
            window: ReceiveWindow::new(config.receive_window, config.nak_threshold),
            splits: SplitAssembler::new(config.max_split_parts, config.max_concurrent_splits),
            ordering: OrderingChannels::new(config.max_ordered_backlog),
            outbox: VecDeque::new(),
            stats: ReliabilityStats::default(),
        }
    }

    /// Queue one payload; it goes out on the next [`flush`](Self::flush)
    pub fn send(&mut self, payload: Bytes, reliability: Reliability, channel: u8) -> Result<()> {
        if channel >= MAX_CHANNELS {
            return Err(ProtocolError::malformed(constants::ERR_BAD_CHANNEL));
        }
        let ordered = reliability.is_ordered();
        let order = if ordered {
            let slot = &mut self.next_order[channel as usize];
            let index = *slot;
            *slot = slot.wrapping_add(1);
            Some(OrderInfo { index, channel })
        } else {
            None
        };

        let room = self.mtu - DATA_HEADER_LEN;
        if payload.len() + Frame::header_len(ordered, false) <= room {
            self.pending.push(Frame {
                reliability,
                order,
                split: None,
                body: payload,
            });
            return Ok(());
        }

        let chunk = room - Frame::header_len(ordered, true);
        let count = payload.len().div_ceil(chunk);
        if count > self.max_split_parts as usize {
            return Err(ProtocolError::malformed(constants::ERR_FRAME_TOO_LARGE));
        }
        let id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        for index in 0..count {
            let start = index * chunk;
            let end = (start + chunk).min(payload.len());
            self.pending.push(Frame {
                reliability,
                order,
                split: Some(SplitInfo {
                    count: count as u32,
                    id,
                    index: index as u32,
                }),
                body: payload.slice(start..end),
            });
        }
        trace!(split_id = id, fragments = count, "Payload split");
        Ok(())
    }

    /// Pack queued frames into datagrams
    pub fn flush(&mut self, now: Instant) {
        let room = self.mtu - DATA_HEADER_LEN;
        let mut frames: Vec<Frame> = Vec::new();
        let mut used = 0;

        for frame in std::mem::take(&mut self.pending) {
            let len = frame.encoded_len();
            if !frames.is_empty() && used + len > room {
                self.emit_data(std::mem::take(&mut frames), now);
                used = 0;
            }
            used += len;
            frames.push(frame);
        }
        if !frames.is_empty() {
            self.emit_data(frames, now);
        }
    }

    fn emit_data(&mut self, frames: Vec<Frame>, now: Instant) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let reliable = frames.iter().any(|f| f.reliability.is_reliable());

        let bytes = Datagram::Data { seq, frames }.encode();
        // an unreliable datagram is resent empty so the peer's window can
        // still move past its sequence number
        let resend = if reliable {
            bytes.clone()
        } else {
            Datagram::Data {
                seq,
                frames: Vec::new(),
            }
            .encode()
        };
        self.ledger.record(seq, resend, now);
        self.outbox.push_back(bytes);
    }

    /// Process one raw datagram from the peer
    pub fn handle_datagram(&mut self, raw: Bytes, now: Instant) -> Result<Received> {
        let mut received = Received::default();

        match Datagram::decode(raw)? {
            Datagram::Ack(ranges) => {
                self.stats.acks_received += 1;
                let removed = self.ledger.acknowledge_ranges(&ranges, now);
                trace!(removed, in_flight = self.ledger.len(), "ACK processed");
            }
            Datagram::Nak(ranges) => {
                self.stats.naks_received += 1;
                let resend = self.ledger.negative_ranges(&ranges, now)?;
                self.stats.retransmissions += resend.len() as u64;
                self.outbox.extend(resend);
            }
            Datagram::Data { seq, frames } => match self.window.check(seq) {
                Admission::Duplicate => self.stats.duplicates += 1,
                Admission::OutOfWindow => {
                    self.stats.out_of_window += 1;
                    debug!(seq, base = self.window.base(), "Datagram outside receive window");
                }
                Admission::Fresh if !self.has_room(&frames) => {
                    // left unacked; the sender's retransmission brings it back
                    self.stats.deferred += 1;
                    debug!(
                        seq,
                        splits = self.splits.in_progress(),
                        buffered = self.ordering.buffered(),
                        "Datagram deferred, reassembly buffers full"
                    );
                }
                Admission::Fresh => {
                    self.window.record(seq);
                    for frame in frames {
                        if let Err(e) = self.accept_frame(frame, &mut received.payloads) {
                            received.errors.push(e);
                        }
                    }
                }
            },
        }

        Ok(received)
    }

    fn has_room(&self, frames: &[Frame]) -> bool {
        self.splits.has_room(frames)
            && frames
                .iter()
                .filter_map(|f| f.order)
                .all(|order| self.ordering.has_room(order))
    }

    fn accept_frame(&mut self, frame: Frame, out: &mut Vec<Bytes>) -> Result<()> {
        let Some(frame) = self.splits.insert(frame)? else {
            return Ok(());
        };
        match frame.order {
            Some(order) => out.extend(self.ordering.push(order, frame.body)?),
            None => out.push(frame.body),
        }
        Ok(())
    }

    /// Resend expired datagrams and queue ACK/NAK datagrams.
    ///
    /// Fails with `RetransmissionExceeded` once a datagram has been resent
    /// the maximum number of times.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        self.flush(now);
        let resend = self.ledger.due(now)?;
        if !resend.is_empty() {
            debug!(count = resend.len(), rto_ms = self.ledger.rto().as_millis() as u64, "Retransmitting");
        }
        self.stats.retransmissions += resend.len() as u64;
        self.outbox.extend(resend);
        self.flush_acks();
        Ok(())
    }

    /// Queue ACK and NAK datagrams for everything observed since the last
    /// flush
    pub fn flush_acks(&mut self) {
        let acks = self.window.take_acks();
        let naks = self.window.take_naks();
        let per_datagram = ((self.mtu - ACK_HEADER_LEN) / ACK_RANGE_MAX_LEN).max(1);

        for chunk in acks.chunks(per_datagram) {
            self.outbox.push_back(Datagram::Ack(chunk.to_vec()).encode());
        }
        for chunk in naks.chunks(per_datagram) {
            self.outbox.push_back(Datagram::Nak(chunk.to_vec()).encode());
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty() || !self.pending.is_empty()
    }

    /// Datagrams sent but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    pub fn rto(&self) -> Duration {
        self.ledger.rto()
    }

    pub fn take_stats(&mut self) -> ReliabilityStats {
        std::mem::take(&mut self.stats)
    }

    /// Sequence numbers handed out so far
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }
}
