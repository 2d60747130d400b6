//! Datagram wire format.
//!
//! All multi-byte header fields are big-endian.
//!
//! ```text
//! data:  0x80 | seq u32 | frame*
//! frame: flags u8 | body_len u16 | [order_index u32 | channel u8] | [split_count u32 | split_id u16 | split_index u32] | body
//! ack:   0xC0 | range_count u16 | (single u8 | start u32 | [end u32])*
//! nak:   0xA0 | same as ack
//! ```
//!
//! The top three bits of `flags` carry the [`Reliability`] mode, `0x10` marks
//! a fragment. Ordering fields are present only for `ReliableOrdered`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

pub const DATAGRAM_DATA: u8 = 0x80;
pub const DATAGRAM_ACK: u8 = 0xC0;
pub const DATAGRAM_NAK: u8 = 0xA0;

/// Kind byte plus sequence number
pub const DATA_HEADER_LEN: usize = 5;

/// Kind byte plus range count
pub const ACK_HEADER_LEN: usize = 3;

/// Largest encoded size of one ACK/NAK range
pub const ACK_RANGE_MAX_LEN: usize = 9;

/// Number of independent ordering channels
pub const MAX_CHANNELS: u8 = 32;

const SPLIT_FLAG: u8 = 0x10;
const RELIABILITY_SHIFT: u8 = 5;

/// Delivery guarantee of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    /// No ordering; the datagram is still acknowledged but its frames are
    /// never resent
    Unreliable,
    /// Resent until acknowledged, delivered as soon as it arrives
    Reliable,
    /// Resent until acknowledged, delivered in order within its channel
    ReliableOrdered,
}

impl Reliability {
    fn bits(self) -> u8 {
        match self {
            Reliability::Unreliable => 0,
            Reliability::Reliable => 2,
            Reliability::ReliableOrdered => 3,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Reliability::Unreliable),
            2 => Some(Reliability::Reliable),
            3 => Some(Reliability::ReliableOrdered),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        !matches!(self, Reliability::Unreliable)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderInfo {
    pub index: u32,
    pub channel: u8,
}

/// Position of a fragment within a split batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    pub order: Option<OrderInfo>,
    pub split: Option<SplitInfo>,
    pub body: Bytes,
}

impl Frame {
    /// Header size for a frame with the given options
    pub fn header_len(ordered: bool, split: bool) -> usize {
        3 + if ordered { 5 } else { 0 } + if split { 10 } else { 0 }
    }

    pub fn encoded_len(&self) -> usize {
        Self::header_len(self.order.is_some(), self.split.is_some()) + self.body.len()
    }

    fn encode(&self, out: &mut BytesMut) {
        let mut flags = self.reliability.bits() << RELIABILITY_SHIFT;
        if self.split.is_some() {
            flags |= SPLIT_FLAG;
        }
        out.put_u8(flags);
        out.put_u16(self.body.len() as u16);
        if let Some(order) = self.order {
            out.put_u32(order.index);
            out.put_u8(order.channel);
        }
        if let Some(split) = self.split {
            out.put_u32(split.count);
            out.put_u16(split.id);
            out.put_u32(split.index);
        }
        out.put_slice(&self.body);
    }

    fn decode(buf: &mut Bytes) -> Result<Frame> {
        if buf.remaining() < 3 {
            return Err(ProtocolError::malformed(constants::ERR_BAD_FRAME));
        }
        let flags = buf.get_u8();
        let body_len = buf.get_u16() as usize;
        let reliability = Reliability::from_bits(flags >> RELIABILITY_SHIFT)
            .ok_or_else(|| ProtocolError::malformed(constants::ERR_BAD_FRAME))?;

        let order = if reliability.is_ordered() {
            if buf.remaining() < 5 {
                return Err(ProtocolError::malformed(constants::ERR_BAD_FRAME));
            }
            let index = buf.get_u32();
            let channel = buf.get_u8();
            if channel >= MAX_CHANNELS {
                return Err(ProtocolError::malformed(constants::ERR_BAD_CHANNEL));
            }
            Some(OrderInfo { index, channel })
        } else {
            None
        };

        let split = if flags & SPLIT_FLAG != 0 {
            if buf.remaining() < 10 {
                return Err(ProtocolError::malformed(constants::ERR_BAD_FRAME));
            }
            let count = buf.get_u32();
            let id = buf.get_u16();
            let index = buf.get_u32();
            if count == 0 || index >= count {
                return Err(ProtocolError::malformed(constants::ERR_BAD_SPLIT));
            }
            Some(SplitInfo { count, id, index })
        } else {
            None
        };

        if buf.remaining() < body_len {
            return Err(ProtocolError::malformed(constants::ERR_LENGTH_PREFIX));
        }
        let body = buf.split_to(body_len);

        Ok(Frame {
            reliability,
            order,
            split,
            body,
        })
    }
}

/// Inclusive range of sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub start: u32,
    pub end: u32,
}

impl SeqRange {
    pub fn single(seq: u32) -> Self {
        Self {
            start: seq,
            end: seq,
        }
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.start <= seq && seq <= self.end
    }
}

/// Collapse ascending sequence numbers into ranges
pub fn ranges_from<I: IntoIterator<Item = u32>>(sorted: I) -> Vec<SeqRange> {
    let mut ranges: Vec<SeqRange> = Vec::new();
    for seq in sorted {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(seq) => last.end = seq,
            Some(last) if last.end == seq => {}
            _ => ranges.push(SeqRange::single(seq)),
        }
    }
    ranges
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Data { seq: u32, frames: Vec<Frame> },
    Ack(Vec<SeqRange>),
    Nak(Vec<SeqRange>),
}

impl Datagram {
    pub fn encode(&self) -> Bytes {
        match self {
            Datagram::Data { seq, frames } => {
                let len = DATA_HEADER_LEN + frames.iter().map(Frame::encoded_len).sum::<usize>();
                let mut out = BytesMut::with_capacity(len);
                out.put_u8(DATAGRAM_DATA);
                out.put_u32(*seq);
                for frame in frames {
                    frame.encode(&mut out);
                }
                out.freeze()
            }
            Datagram::Ack(ranges) => encode_ranges(DATAGRAM_ACK, ranges),
            Datagram::Nak(ranges) => encode_ranges(DATAGRAM_NAK, ranges),
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Datagram> {
        if !buf.has_remaining() {
            return Err(ProtocolError::malformed(constants::ERR_EMPTY_DATAGRAM));
        }
        match buf.get_u8() {
            DATAGRAM_DATA => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::malformed(constants::ERR_UNEXPECTED_EOF));
                }
                let seq = buf.get_u32();
                let mut frames = Vec::new();
                while buf.has_remaining() {
                    frames.push(Frame::decode(&mut buf)?);
                }
                Ok(Datagram::Data { seq, frames })
            }
            DATAGRAM_ACK => Ok(Datagram::Ack(decode_ranges(&mut buf)?)),
            DATAGRAM_NAK => Ok(Datagram::Nak(decode_ranges(&mut buf)?)),
            _ => Err(ProtocolError::malformed(constants::ERR_UNKNOWN_DATAGRAM)),
        }
    }
}

fn encode_ranges(kind: u8, ranges: &[SeqRange]) -> Bytes {
    let mut out = BytesMut::with_capacity(ACK_HEADER_LEN + ranges.len() * ACK_RANGE_MAX_LEN);
    out.put_u8(kind);
    out.put_u16(ranges.len() as u16);
    for range in ranges {
        if range.start == range.end {
            out.put_u8(1);
            out.put_u32(range.start);
        } else {
            out.put_u8(0);
            out.put_u32(range.start);
            out.put_u32(range.end);
        }
    }
    out.freeze()
}

fn decode_ranges(buf: &mut Bytes) -> Result<Vec<SeqRange>> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::malformed(constants::ERR_UNEXPECTED_EOF));
    }
    let count = buf.get_u16() as usize;
    // every range takes at least five bytes
    if count * 5 > buf.remaining() {
        return Err(ProtocolError::malformed(constants::ERR_LENGTH_PREFIX));
    }
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 5 {
            return Err(ProtocolError::malformed(constants::ERR_UNEXPECTED_EOF));
        }
        let single = buf.get_u8() != 0;
        let start = buf.get_u32();
        let end = if single {
            start
        } else {
            if buf.remaining() < 4 {
                return Err(ProtocolError::malformed(constants::ERR_UNEXPECTED_EOF));
            }
            buf.get_u32()
        };
        if start > end {
            return Err(ProtocolError::malformed(constants::ERR_BAD_ACK_RANGE));
        }
        ranges.push(SeqRange { start, end });
    }
    if buf.has_remaining() {
        return Err(ProtocolError::malformed(constants::ERR_TRAILING_BYTES));
    }
    Ok(ranges)
}
