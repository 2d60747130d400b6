//! Replay cache for connection requests.
//!
//! A captured `ConnectionRequest` replayed within the timestamp window would
//! otherwise open a second handshake from the same peer. The cache remembers
//! (peer address, nonce) pairs for a TTL and reports a replay when the same
//! pair arrives again with the same timestamp.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    added_at: Instant,
    timestamp: u64,
}

/// Key for cache entries - peer address plus nonce
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    peer: SocketAddr,
    nonce: [u8; 16],
}

/// TTL-based replay cache with FIFO eviction
#[derive(Debug)]
pub struct ReplayCache {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Insertion order for O(1) eviction of the oldest entry
    insertion_order: VecDeque<CacheKey>,
    ttl: Duration,
    max_entries: usize,
}

impl ReplayCache {
    /// Default TTL 60 s (twice the handshake timestamp window), 10,000 entries
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(60), 10_000)
    }

    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns true if this nonce/timestamp was already seen from `peer`;
    /// otherwise records it and returns false.
    pub fn is_replay(&mut self, peer: SocketAddr, nonce: &[u8; 16], timestamp: u64) -> bool {
        let now = Instant::now();
        self.cleanup_expired(now);

        let key = CacheKey {
            peer,
            nonce: *nonce,
        };

        if let Some(entry) = self.entries.get(&key) {
            if entry.timestamp == timestamp {
                warn!(%peer, timestamp, "Replayed connection request detected");
                return true;
            }
            debug!(%peer, "Nonce seen before with different timestamp - allowing");
        }

        while self.entries.len() >= self.max_entries {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        if self
            .entries
            .insert(key.clone(), CacheEntry { added_at: now, timestamp })
            .is_none()
        {
            self.insertion_order.push_back(key);
        }
        false
    }

    fn cleanup_expired(&mut self, now: Instant) {
        while let Some(key) = self.insertion_order.front() {
            let expired = self
                .entries
                .get(key)
                .map(|entry| now.duration_since(entry.added_at) >= self.ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(key) = self.insertion_order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}
