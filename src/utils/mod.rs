//! # Utility Modules
//!
//! Supporting utilities for cryptography, compression, logging, and timing.
//!
//! ## Components
//! - **Crypto**: ChaCha20-Poly1305 batch sealing with directional keys
//! - **Compression**: LZ4 and Zstd with size limits and thresholds
//! - **Logging**: Subscriber configuration
//! - **Timeout**: Async timeout wrappers and lifecycle defaults
//! - **Replay Cache**: TTL-based nonce deduplication for connection requests
//! - **Metrics**: Per-server observability counters
//!
//! ## Security
//! - Decompression bomb protection (size and ratio ceilings)
//! - Memory zeroing for key material (zeroize crate)

pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod timeout;

pub use replay_cache::ReplayCache;
