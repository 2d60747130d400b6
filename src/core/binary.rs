//! Bounds-checked readers and writers for packet bodies.
//!
//! Fixed-width numbers are little-endian. Strings and blobs carry a var-int
//! byte count. Every read checks the remaining length first so a short body
//! surfaces as `MalformedPacket` instead of a panic inside `bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::varint;
use crate::error::{constants, ProtocolError, Result};

/// Cursor over a single packet body
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

macro_rules! read_fixed {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(&mut self) -> Result<$ty> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn ensure(&self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            Err(ProtocolError::malformed(constants::ERR_UNEXPECTED_EOF))
        } else {
            Ok(())
        }
    }

    read_fixed!(read_u8, u8, get_u8);
    read_fixed!(read_i8, i8, get_i8);
    read_fixed!(read_u16, u16, get_u16_le);
    read_fixed!(read_i16, i16, get_i16_le);
    read_fixed!(read_u32, u32, get_u32_le);
    read_fixed!(read_i32, i32, get_i32_le);
    read_fixed!(read_u64, u64, get_u64_le);
    read_fixed!(read_i64, i64, get_i64_le);
    read_fixed!(read_f32, f32, get_f32_le);
    read_fixed!(read_f64, f64, get_f64_le);

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::MalformedPacket(format!(
                "invalid bool byte 0x{other:02x}"
            ))),
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        varint::read_var_u32(&mut self.buf)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        varint::read_var_u64(&mut self.buf)
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        varint::read_var_i32(&mut self.buf)
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        varint::read_var_i64(&mut self.buf)
    }

    /// Fixed-size array, e.g. public keys and nonces
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Length-prefixed blob; the prefix is checked against the remaining bytes
    /// before anything is copied.
    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_var_u32()? as usize;
        if len > self.buf.len() {
            return Err(ProtocolError::malformed(constants::ERR_LENGTH_PREFIX));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::malformed(constants::ERR_INVALID_UTF8))
    }

    /// Take everything left, used by opaque trailing payloads
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    /// Assert the body was consumed exactly
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::MalformedPacket(format!(
                "{} ({} bytes)",
                constants::ERR_TRAILING_BYTES,
                self.buf.len()
            )))
        }
    }
}

/// Growable packet body writer
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn write_var_u32(&mut self, v: u32) {
        varint::write_var_u32(&mut self.buf, v);
    }

    pub fn write_var_u64(&mut self, v: u64) {
        varint::write_var_u64(&mut self.buf, v);
    }

    pub fn write_var_i32(&mut self, v: i32) {
        varint::write_var_i32(&mut self.buf, v);
    }

    pub fn write_var_i64(&mut self, v: i64) {
        varint::write_var_i64(&mut self.buf, v);
    }

    pub fn write_array(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    pub fn write_blob(&mut self, v: &[u8]) -> Result<()> {
        let len = u32::try_from(v.len())
            .map_err(|_| ProtocolError::MalformedPacket("blob longer than u32::MAX".into()))?;
        self.write_var_u32(len);
        self.buf.put_slice(v);
        Ok(())
    }

    pub fn write_string(&mut self, v: &str) -> Result<()> {
        self.write_blob(v.as_bytes())
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
