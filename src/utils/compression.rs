//! Batch compression.
//!
//! Once a session negotiates an algorithm every batch carries a one-byte
//! header: [`UNCOMPRESSED_MARKER`] for batches sent as-is, otherwise the
//! algorithm's wire id. Small or high-entropy batches skip compression.
//!
//! Decompression is bounded twice: by an absolute output ceiling and by an
//! expansion ratio relative to the compressed input, so a few hundred bytes of
//! crafted input cannot inflate into megabytes.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Header byte of a batch that was left uncompressed
pub const UNCOMPRESSED_MARKER: u8 = 0xFF;

/// Output below this size is never rejected by the ratio check
const RATIO_FLOOR_BYTES: usize = 64 * 1024;

/// Minimum entropy threshold for compression (0.0-8.0 bits per byte)
/// Data above this threshold is unlikely to compress well
const MIN_ENTROPY_THRESHOLD: f64 = 7.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

impl CompressionKind {
    pub fn wire_id(self) -> u8 {
        match self {
            CompressionKind::Lz4 => 0x01,
            CompressionKind::Zstd => 0x02,
        }
    }

    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(CompressionKind::Lz4),
            0x02 => Some(CompressionKind::Zstd),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::Lz4 => "lz4",
            CompressionKind::Zstd => "zstd",
        }
    }
}

/// Bounds applied to every decompression
#[derive(Debug, Clone, Copy)]
pub struct DecompressionLimits {
    /// Absolute ceiling on decompressed bytes
    pub max_size: usize,
    /// Maximum output/input ratio once output passes 64 KiB
    pub max_ratio: usize,
}

impl DecompressionLimits {
    fn ceiling(&self, input_len: usize) -> usize {
        let by_ratio = input_len
            .saturating_mul(self.max_ratio)
            .max(RATIO_FLOOR_BYTES);
        by_ratio.min(self.max_size)
    }
}

impl Default for DecompressionLimits {
    fn default() -> Self {
        Self {
            max_size: crate::config::MAX_BATCH_SIZE,
            max_ratio: 128,
        }
    }
}

/// Calculate Shannon entropy of data (bits per byte)
/// Returns a value between 0.0 (all identical) and 8.0 (perfectly random)
fn calculate_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    let mut entropy = 0.0;

    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }

    entropy
}

/// Adaptive compression decision based on size and entropy
fn should_compress_adaptive(data: &[u8], threshold_bytes: usize) -> bool {
    if data.len() < threshold_bytes {
        return false;
    }

    if data.len() < 1024 {
        return true;
    }

    // Sample first 512 bytes for entropy calculation
    let sample_size = data.len().min(512);
    calculate_entropy(&data[..sample_size]) < MIN_ENTROPY_THRESHOLD
}

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: CompressionKind, level: i32) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, level)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data that was compressed with the specified algorithm
///
/// # Errors
/// Returns `ProtocolError::DecompressionError` if the stream is corrupt or the
/// output would exceed the limits.
pub fn decompress(data: &[u8], kind: CompressionKind, limits: &DecompressionLimits) -> Result<Vec<u8>> {
    let ceiling = limits.ceiling(data.len());
    match kind {
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionError(
                    "lz4 stream shorter than size header".into(),
                ));
            }

            // Reject the claimed size before lz4_flex allocates for it
            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > ceiling {
                return Err(ProtocolError::DecompressionError(format!(
                    "lz4 claims {claimed_size} bytes, limit {ceiling}"
                )));
            }

            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| ProtocolError::DecompressionError(e.to_string()))
        }
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|e| ProtocolError::DecompressionError(e.to_string()))?;

            // Read in chunks to enforce the ceiling while inflating
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > ceiling {
                            return Err(ProtocolError::DecompressionError(format!(
                                "zstd output exceeds limit {ceiling}"
                            )));
                        }
                    }
                    Err(e) => return Err(ProtocolError::DecompressionError(e.to_string())),
                }
            }
            Ok(out)
        }
    }
}

/// Adaptive compression using entropy analysis to avoid compressing
/// high-entropy data. Returns the output bytes and whether compression was
/// applied.
pub fn maybe_compress_adaptive(
    data: &[u8],
    kind: CompressionKind,
    threshold_bytes: usize,
    level: i32,
) -> Result<(Vec<u8>, bool)> {
    if should_compress_adaptive(data, threshold_bytes) {
        let compressed = compress(data, kind, level)?;

        // Only use compressed version if it's actually smaller
        if compressed.len() < data.len() {
            return Ok((compressed, true));
        }
    }
    Ok((data.to_vec(), false))
}

/// Prefix a batch with its compression header, compressing when worthwhile
pub fn wrap_batch(data: &[u8], kind: CompressionKind, threshold_bytes: usize, level: i32) -> Result<Vec<u8>> {
    let (body, compressed) = maybe_compress_adaptive(data, kind, threshold_bytes, level)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(if compressed {
        kind.wire_id()
    } else {
        UNCOMPRESSED_MARKER
    });
    out.extend_from_slice(&body);
    Ok(out)
}

/// Strip the compression header and inflate if needed.
///
/// A header naming an algorithm other than the negotiated one is treated as a
/// corrupt stream.
pub fn unwrap_batch(data: &[u8], kind: CompressionKind, limits: &DecompressionLimits) -> Result<Vec<u8>> {
    let (&header, body) = data
        .split_first()
        .ok_or_else(|| ProtocolError::DecompressionError("missing compression header".into()))?;

    if header == UNCOMPRESSED_MARKER {
        if body.len() > limits.max_size {
            return Err(ProtocolError::DecompressionError("batch exceeds size limit".into()));
        }
        return Ok(body.to_vec());
    }

    match CompressionKind::from_wire(header) {
        Some(found) if found == kind => decompress(body, kind, limits),
        _ => Err(ProtocolError::DecompressionError(format!(
            "unexpected compression header 0x{header:02x}"
        ))),
    }
}
