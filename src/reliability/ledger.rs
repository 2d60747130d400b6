//! Acknowledgment ledger and retransmission timer.
//!
//! Every data datagram is recorded with its send time. An entry leaves the
//! ledger exactly once: on the first matching ACK, or when its resend count
//! passes the ceiling (the session is then lost).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::reliability::datagram::SeqRange;

/// Smoothed RTT estimator (RFC 6298 constants)
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RtoEstimator {
    pub fn new(initial: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar * 3 / 4 + delta / 4;
                self.srtt = Some(srtt * 7 / 8 + rtt / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        let variance = (self.rttvar * 4).max(Duration::from_millis(1));
        self.rto = (srtt + variance).clamp(self.min_rto, self.max_rto);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Timeout after `attempts` resends: doubled each time, capped at max
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(16);
        self.rto.saturating_mul(factor).min(self.max_rto)
    }
}

#[derive(Debug)]
struct InFlight {
    /// Exact bytes to put back on the wire
    resend: Bytes,
    last_sent: Instant,
    first_sent: Instant,
    attempts: u32,
}

#[derive(Debug)]
pub struct AckLedger {
    entries: BTreeMap<u32, InFlight>,
    estimator: RtoEstimator,
    max_retransmissions: u32,
}

impl AckLedger {
    pub fn new(estimator: RtoEstimator, max_retransmissions: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            estimator,
            max_retransmissions,
        }
    }

    pub fn record(&mut self, seq: u32, resend: Bytes, now: Instant) {
        self.entries.insert(
            seq,
            InFlight {
                resend,
                last_sent: now,
                first_sent: now,
                attempts: 0,
            },
        );
    }

    /// Remove `seq`; returns false if it was not outstanding.
    ///
    /// Only never-resent datagrams feed the RTT estimator.
    pub fn acknowledge(&mut self, seq: u32, now: Instant) -> bool {
        match self.entries.remove(&seq) {
            Some(entry) => {
                if entry.attempts == 0 {
                    self.estimator.sample(now.saturating_duration_since(entry.first_sent));
                }
                true
            }
            None => false,
        }
    }

    /// Acknowledge every outstanding datagram in `ranges`; returns how many
    /// entries were removed
    pub fn acknowledge_ranges(&mut self, ranges: &[SeqRange], now: Instant) -> usize {
        let mut removed = 0;
        for range in ranges {
            let seqs: Vec<u32> = self
                .entries
                .range(range.start..=range.end)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in seqs {
                if self.acknowledge(seq, now) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Datagrams the peer reported missing, to be resent immediately
    pub fn negative_ranges(&mut self, ranges: &[SeqRange], now: Instant) -> Result<Vec<Bytes>> {
        let mut resend = Vec::new();
        for range in ranges {
            let seqs: Vec<u32> = self
                .entries
                .range(range.start..=range.end)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in seqs {
                resend.push(self.resend(seq, now)?);
            }
        }
        Ok(resend)
    }

    /// Datagrams whose backed-off timeout has expired at `now`
    pub fn due(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.last_sent)
                    >= self.estimator.backoff(entry.attempts)
            })
            .map(|(seq, _)| *seq)
            .collect();

        let mut resend = Vec::with_capacity(expired.len());
        for seq in expired {
            resend.push(self.resend(seq, now)?);
        }
        Ok(resend)
    }

    fn resend(&mut self, seq: u32, now: Instant) -> Result<Bytes> {
        let exceeded = match self.entries.get_mut(&seq) {
            Some(entry) if entry.attempts < self.max_retransmissions => {
                entry.attempts += 1;
                entry.last_sent = now;
                return Ok(entry.resend.clone());
            }
            Some(_) => true,
            None => false,
        };
        if exceeded {
            self.entries.remove(&seq);
        }
        Err(ProtocolError::RetransmissionExceeded(seq))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn rto(&self) -> Duration {
        self.estimator.rto()
    }

    pub fn estimator(&self) -> &RtoEstimator {
        &self.estimator
    }
}
