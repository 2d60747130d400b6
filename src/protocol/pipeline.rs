//! Batch codec pipeline.
//!
//! Outbound: packets -> batch framing -> compression header (once negotiated)
//! -> seal (once keys exist). Inbound runs the same stages in reverse:
//! decryption before decompression. Both stages switch on between two batches,
//! never inside one, which is what lets the peer follow along.

use bytes::Bytes;
use tracing::trace;

use crate::config::TransportConfig;
use crate::core::batch::{decode_batch, encode_batch};
use crate::core::packet::Packet;
use crate::core::schema::PacketRegistry;
use crate::error::Result;
use crate::utils::compression::{unwrap_batch, wrap_batch, CompressionKind, DecompressionLimits};
use crate::utils::crypto::{BatchCipher, SessionKeys};

#[derive(Debug, Clone, Copy)]
struct Negotiated {
    kind: CompressionKind,
    threshold: usize,
    level: i32,
}

#[derive(Debug)]
pub struct BatchPipeline {
    registry: PacketRegistry,
    cipher: Option<BatchCipher>,
    compression: Option<Negotiated>,
    limits: DecompressionLimits,
    level: i32,
    max_packets: usize,
}

impl BatchPipeline {
    pub fn new(registry: PacketRegistry, transport: &TransportConfig, max_packets: usize) -> Self {
        Self {
            registry,
            cipher: None,
            compression: None,
            limits: transport.decompression_limits(),
            level: transport.compression_level,
            max_packets,
        }
    }

    /// Seal and open every following batch with `keys`
    pub fn enable_encryption(&mut self, keys: SessionKeys) {
        self.cipher = Some(BatchCipher::new(keys));
    }

    /// Add the compression header to every following batch
    pub fn enable_compression(&mut self, kind: CompressionKind, threshold: usize) {
        self.compression = Some(Negotiated {
            kind,
            threshold,
            level: self.level,
        });
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn compression(&self) -> Option<CompressionKind> {
        self.compression.map(|c| c.kind)
    }

    pub fn registry(&self) -> &PacketRegistry {
        &self.registry
    }

    pub fn encode(&mut self, packets: &[Packet]) -> Result<Bytes> {
        let mut payload = encode_batch(packets, &self.registry)?.to_vec();
        if let Some(c) = self.compression {
            payload = wrap_batch(&payload, c.kind, c.threshold, c.level)?;
        }
        if let Some(cipher) = self.cipher.as_mut() {
            payload = cipher.seal(&payload)?;
        }
        trace!(packets = packets.len(), bytes = payload.len(), "Batch encoded");
        Ok(Bytes::from(payload))
    }

    /// Decode one batch. The outer `Err` (decryption or decompression) is fatal
    /// to the session; inner errors concern single packets.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<Result<Packet>>> {
        let opened;
        let mut data = payload;
        if let Some(cipher) = self.cipher.as_mut() {
            opened = cipher.open(data)?;
            data = &opened;
        }
        let inflated;
        if let Some(c) = self.compression {
            inflated = unwrap_batch(data, c.kind, &self.limits)?;
            data = &inflated;
        }
        Ok(decode_batch(data, &self.registry, self.max_packets))
    }
}
