//! Variable-length integers.
//!
//! Each byte carries 7 data bits, least significant group first; the high bit
//! marks that another byte follows. Decoding is bounded: a `u32` may use at
//! most 5 bytes and a `u64` at most 10, anything longer is rejected before the
//! reader walks off into attacker-controlled input.

use bytes::{Buf, BufMut};

use crate::error::{constants, ProtocolError, Result};

/// Maximum encoded length of a 32-bit var-int
pub const MAX_VARINT32_LEN: usize = 5;

/// Maximum encoded length of a 64-bit var-int
pub const MAX_VARINT64_LEN: usize = 10;

const CONTINUATION: u8 = 0x80;
const DATA_MASK: u8 = 0x7F;

#[inline]
pub fn write_var_u32<B: BufMut>(buf: &mut B, value: u32) {
    write_var_u64(buf, value as u64);
}

#[inline]
pub fn write_var_u64<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= CONTINUATION as u64 {
        buf.put_u8((value as u8 & DATA_MASK) | CONTINUATION);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

#[inline]
pub fn write_var_i32<B: BufMut>(buf: &mut B, value: i32) {
    write_var_u32(buf, ((value << 1) ^ (value >> 31)) as u32);
}

#[inline]
pub fn write_var_i64<B: BufMut>(buf: &mut B, value: i64) {
    write_var_u64(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn read_bounded<B: Buf>(buf: &mut B, max_len: usize, value_bits: u32) -> Result<u64> {
    let mut result: u64 = 0;
    for i in 0..max_len {
        if !buf.has_remaining() {
            return Err(ProtocolError::malformed(constants::ERR_VARINT_TRUNCATED));
        }
        let byte = buf.get_u8();
        let shift = 7 * i as u32;
        let chunk = (byte & DATA_MASK) as u64;

        // The final permitted byte may only contribute the bits that still fit.
        if shift + 7 > value_bits && chunk >> (value_bits - shift) != 0 {
            return Err(ProtocolError::malformed(constants::ERR_VARINT_TOO_LONG));
        }
        result |= chunk << shift;

        if byte & CONTINUATION == 0 {
            return Ok(result);
        }
    }
    Err(ProtocolError::malformed(constants::ERR_VARINT_TOO_LONG))
}

pub fn read_var_u32<B: Buf>(buf: &mut B) -> Result<u32> {
    read_bounded(buf, MAX_VARINT32_LEN, 32).map(|v| v as u32)
}

pub fn read_var_u64<B: Buf>(buf: &mut B) -> Result<u64> {
    read_bounded(buf, MAX_VARINT64_LEN, 64)
}

pub fn read_var_i32<B: Buf>(buf: &mut B) -> Result<i32> {
    let raw = read_var_u32(buf)?;
    Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
}

pub fn read_var_i64<B: Buf>(buf: &mut B) -> Result<i64> {
    let raw = read_var_u64(buf)?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
}

/// Number of bytes `value` occupies once encoded
pub fn var_u32_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}
