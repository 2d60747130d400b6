//! Inbound bookkeeping: duplicate detection, fragment reassembly and
//! per-channel ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::{Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};
use crate::reliability::datagram::{ranges_from, Frame, OrderInfo, SeqRange, MAX_CHANNELS};

/// Outcome of offering a sequence number to the [`ReceiveWindow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Duplicate,
    /// Too far ahead of the lowest missing sequence number; dropped unacked
    OutOfWindow,
}

/// Tracks which datagram sequence numbers have arrived.
///
/// Everything below `base` has been received. Sequence numbers at or above
/// `base + window` are refused so a hostile peer cannot grow the set without
/// bound.
#[derive(Debug)]
pub struct ReceiveWindow {
    base: u32,
    received: BTreeSet<u32>,
    highest: Option<u32>,
    window: u32,
    nak_threshold: u32,
    nak_sent: BTreeSet<u32>,
    pending_acks: BTreeSet<u32>,
}

impl ReceiveWindow {
    pub fn new(window: u32, nak_threshold: u32) -> Self {
        Self {
            base: 0,
            received: BTreeSet::new(),
            highest: None,
            window,
            nak_threshold,
            nak_sent: BTreeSet::new(),
            pending_acks: BTreeSet::new(),
        }
    }

    /// Check and record in one step
    pub fn admit(&mut self, seq: u32) -> Admission {
        let admission = self.check(seq);
        if admission == Admission::Fresh {
            self.record(seq);
        }
        admission
    }

    /// Classify `seq` without marking it received. Duplicates are queued
    /// for another ACK.
    pub fn check(&mut self, seq: u32) -> Admission {
        if seq < self.base || self.received.contains(&seq) {
            // our ACK was probably lost
            self.pending_acks.insert(seq);
            return Admission::Duplicate;
        }
        if seq >= self.base.saturating_add(self.window) {
            return Admission::OutOfWindow;
        }
        Admission::Fresh
    }

    /// Mark a fresh `seq` received and queue its ACK
    pub fn record(&mut self, seq: u32) {
        if seq < self.base || !self.received.insert(seq) {
            return;
        }
        self.pending_acks.insert(seq);
        self.nak_sent.remove(&seq);
        self.highest = Some(self.highest.map_or(seq, |h| h.max(seq)));

        while self.received.remove(&self.base) {
            self.base = self.base.saturating_add(1);
        }
    }

    /// Sequence numbers to acknowledge, as ranges; clears the pending set
    pub fn take_acks(&mut self) -> Vec<SeqRange> {
        let acks = std::mem::take(&mut self.pending_acks);
        ranges_from(acks)
    }

    /// Gaps that have fallen `nak_threshold` behind the highest received
    /// sequence number. Each gap is reported once.
    pub fn take_naks(&mut self) -> Vec<SeqRange> {
        let Some(highest) = self.highest else {
            return Vec::new();
        };
        let Some(limit) = highest.checked_sub(self.nak_threshold) else {
            return Vec::new();
        };

        let mut missing = Vec::new();
        let mut seq = self.base;
        while seq <= limit {
            if !self.received.contains(&seq) && self.nak_sent.insert(seq) {
                missing.push(seq);
            }
            seq += 1;
        }
        let base = self.base;
        self.nak_sent.retain(|s| *s >= base);
        ranges_from(missing)
    }

    /// Lowest sequence number not yet received
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn highest(&self) -> Option<u32> {
        self.highest
    }
}

#[derive(Debug)]
struct PartialSplit {
    parts: Vec<Option<Bytes>>,
    received: u32,
    template: Frame,
}

/// Buffers fragments by split id until every index is present
#[derive(Debug)]
pub struct SplitAssembler {
    splits: HashMap<u16, PartialSplit>,
    max_parts: u32,
    max_concurrent: usize,
}

impl SplitAssembler {
    pub fn new(max_parts: u32, max_concurrent: usize) -> Self {
        Self {
            splits: HashMap::new(),
            max_parts,
            max_concurrent,
        }
    }

    /// Store one fragment; returns the reassembled frame once complete.
    /// Duplicate fragments are discarded.
    pub fn insert(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let Some(split) = frame.split else {
            return Ok(Some(frame));
        };
        if split.count > self.max_parts || split.index >= split.count {
            return Err(ProtocolError::malformed(constants::ERR_BAD_SPLIT));
        }

        if !self.splits.contains_key(&split.id) && self.splits.len() >= self.max_concurrent {
            return Err(ProtocolError::malformed(constants::ERR_TOO_MANY_SPLITS));
        }

        let partial = self.splits.entry(split.id).or_insert_with(|| PartialSplit {
            parts: vec![None; split.count as usize],
            received: 0,
            template: Frame {
                reliability: frame.reliability,
                order: frame.order,
                split: None,
                body: Bytes::new(),
            },
        });

        if partial.parts.len() != split.count as usize {
            return Err(ProtocolError::malformed(constants::ERR_BAD_SPLIT));
        }

        let slot = &mut partial.parts[split.index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(frame.body);
        partial.received += 1;

        if partial.received < split.count {
            return Ok(None);
        }

        let Some(done) = self.splits.remove(&split.id) else {
            return Ok(None);
        };
        let total = done.parts.iter().flatten().map(Bytes::len).sum();
        let mut body = BytesMut::with_capacity(total);
        for part in done.parts.into_iter().flatten() {
            body.extend_from_slice(&part);
        }
        Ok(Some(Frame {
            body: body.freeze(),
            ..done.template
        }))
    }

    pub fn in_progress(&self) -> usize {
        self.splits.len()
    }

    /// Whether the fragments in `frames` can be buffered without going over
    /// the concurrent reassembly limit
    pub fn has_room(&self, frames: &[Frame]) -> bool {
        let mut opened: Vec<u16> = Vec::new();
        for split in frames.iter().filter_map(|f| f.split) {
            if !self.splits.contains_key(&split.id) && !opened.contains(&split.id) {
                opened.push(split.id);
            }
        }
        self.splits.len() + opened.len() <= self.max_concurrent
    }
}

#[derive(Debug, Default)]
struct OrderChannel {
    next: u32,
    pending: BTreeMap<u32, Bytes>,
}

/// Releases ordered frames per channel in order-index order
#[derive(Debug)]
pub struct OrderingChannels {
    channels: Vec<OrderChannel>,
    max_backlog: u32,
}

impl OrderingChannels {
    pub fn new(max_backlog: u32) -> Self {
        Self {
            channels: (0..MAX_CHANNELS).map(|_| OrderChannel::default()).collect(),
            max_backlog,
        }
    }

    /// Offer one frame body; returns every body now deliverable on its channel
    pub fn push(&mut self, order: OrderInfo, body: Bytes) -> Result<Vec<Bytes>> {
        let channel = self
            .channels
            .get_mut(order.channel as usize)
            .ok_or_else(|| ProtocolError::malformed(constants::ERR_BAD_CHANNEL))?;

        if order.index < channel.next {
            return Ok(Vec::new());
        }
        if order.index - channel.next >= self.max_backlog {
            return Err(ProtocolError::malformed(constants::ERR_ORDER_BACKLOG));
        }
        channel.pending.insert(order.index, body);

        let mut ready = Vec::new();
        while let Some(body) = channel.pending.remove(&channel.next) {
            ready.push(body);
            channel.next = channel.next.wrapping_add(1);
        }
        Ok(ready)
    }

    /// Whether `order` falls inside its channel's backlog. Unknown channels
    /// report true and are rejected by [`push`](Self::push).
    pub fn has_room(&self, order: OrderInfo) -> bool {
        match self.channels.get(order.channel as usize) {
            Some(channel) => {
                order.index < channel.next || order.index - channel.next < self.max_backlog
            }
            None => true,
        }
    }

    pub fn buffered(&self) -> usize {
        self.channels.iter().map(|c| c.pending.len()).sum()
    }
}
