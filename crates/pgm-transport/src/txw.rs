//! # Transmit Window
//!
//! Bounded, sequence-indexed ring of sent packets retained for repair.
//! Any receiver may NAK any sequence still inside `[trail, lead]`; the
//! window answers with the original TSDU bytes for RDATA re-encoding.
//!
//! Entry structures live in a slab and payload buffers in a LIFO pool, so
//! steady-state operation allocates nothing. A push onto a full window is
//! not an error: the trailing packet is retired first (receivers that far
//! behind have been lapped — a protocol event, logged and counted).

use slab::Slab;

use crate::error::{PgmError, Result};
use crate::pool::{BufferPool, FragmentInfo, SkBuff};
use crate::sn;
use crate::time::PgmTime;
use crate::tsi::Tsi;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Transmit window sizing. Exactly one of `sqns` or `secs × max_rte` must
/// yield a positive capacity.
#[derive(Debug, Clone)]
pub struct TxwConfig {
    /// Maximum TPDU size; bounds stored TSDUs and sizes pool buffers.
    pub max_tpdu: usize,
    /// Capacity in sequence numbers. 0 selects the rate-derived sizing.
    pub sqns: u32,
    /// Window length in seconds (with `max_rte`).
    pub secs: u32,
    /// Maximum transmit rate in bytes/second (with `secs`).
    pub max_rte: u32,
    /// Buffers to pre-allocate in the payload pool.
    pub preallocate: usize,
    /// Seed for the window lead; the first push is assigned `seed + 1`.
    /// `None` picks a random seed.
    pub initial_sequence: Option<u32>,
}

impl Default for TxwConfig {
    fn default() -> Self {
        TxwConfig {
            max_tpdu: 1500,
            sqns: 0,
            secs: 30,
            max_rte: 400_000,
            preallocate: 0,
            initial_sequence: None,
        }
    }
}

impl TxwConfig {
    /// Resolve the configured capacity in sequences.
    ///
    /// The result is rounded up to a power of two so that the slot mapping
    /// `sqn % capacity` stays injective across the 2³² sequence wrap.
    pub fn capacity(&self) -> Result<u32> {
        if self.max_tpdu == 0 {
            return Err(PgmError::Config("max_tpdu must be positive".into()));
        }
        let raw = if self.sqns > 0 {
            self.sqns
        } else {
            let bytes = u64::from(self.secs) * u64::from(self.max_rte);
            (bytes / self.max_tpdu as u64).min(u32::MAX as u64) as u32
        };
        if raw == 0 {
            return Err(PgmError::Config(
                "window size must be positive: set txw_sqns or txw_secs × txw_max_rte".into(),
            ));
        }
        if raw > 1 << 30 {
            return Err(PgmError::Config(format!(
                "window of {raw} sequences exceeds the 2^30 bound"
            )));
        }
        Ok(raw.next_power_of_two())
    }
}

// ─── Window ─────────────────────────────────────────────────────────────────

struct TxwEntry {
    skb: SkBuff,
    /// Push time; retained alongside the buffer for repair bookkeeping.
    expiry: PgmTime,
    last_retransmit: PgmTime,
}

/// The transmit window.
///
/// Empty state is `trail == lead + 1`; every sequence in `[trail, lead]`
/// of a non-empty window has an entry whose sequence matches.
pub struct TransmitWindow {
    ring: Vec<Option<usize>>,
    entries: Slab<TxwEntry>,
    pool: BufferPool,
    tsi: Tsi,
    capacity: u32,
    max_tpdu: usize,
    /// Window lifetime in µs, used to stamp entry expiry (0 when sized by
    /// sequence count).
    lifetime: PgmTime,
    trail: u32,
    lead: u32,
    /// Forced trail advances from pushes onto a full window.
    advances: u64,
}

impl TransmitWindow {
    pub fn new(config: &TxwConfig, tsi: Tsi) -> Result<Self> {
        let capacity = config.capacity()?;
        let lead = config.initial_sequence.unwrap_or_else(rand::random);
        let lifetime = if config.sqns == 0 {
            u64::from(config.secs) * 1_000_000
        } else {
            0
        };
        tracing::debug!(%tsi, capacity, lead, "transmit window created");
        Ok(TransmitWindow {
            ring: (0..capacity).map(|_| None).collect(),
            entries: Slab::with_capacity(config.preallocate.min(capacity as usize)),
            pool: BufferPool::new(config.max_tpdu, config.preallocate, capacity as usize),
            tsi,
            capacity,
            max_tpdu: config.max_tpdu,
            lifetime,
            trail: lead.wrapping_add(1),
            lead,
            advances: 0,
        })
    }

    // ─── Reporters ──────────────────────────────────────────────────────

    pub fn lead(&self) -> u32 {
        self.lead
    }

    pub fn trail(&self) -> u32 {
        self.trail
    }

    /// The sequence the next push will be assigned.
    pub fn next_lead(&self) -> u32 {
        self.lead.wrapping_add(1)
    }

    /// Occupied size in sequences.
    pub fn len(&self) -> u32 {
        self.lead.wrapping_sub(self.trail).wrapping_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Times the trail was force-advanced by a push onto a full window.
    pub fn forced_advances(&self) -> u64 {
        self.advances
    }

    /// Payload buffers currently held by the window.
    pub fn buffers_held(&self) -> u64 {
        self.pool.outstanding()
    }

    fn slot(&self, sqn: u32) -> usize {
        (sqn % self.capacity) as usize
    }

    // ─── Operations ─────────────────────────────────────────────────────

    /// Append a packet, assigning it the next sequence number. A full
    /// window retires its trail first — never an error.
    pub fn push(&mut self, mut skb: SkBuff, now: PgmTime) -> Result<u32> {
        if skb.len() > self.max_tpdu {
            return Err(PgmError::TooLong {
                length: skb.len(),
                max: self.max_tpdu,
            });
        }
        if self.is_full() {
            tracing::warn!(
                trail = self.trail,
                lead = self.lead,
                "transmit window full, lapping slowest receivers"
            );
            self.advances += 1;
            self.pop();
        }

        self.lead = self.lead.wrapping_add(1);
        skb.sequence = self.lead;
        skb.tstamp = now;
        let entry = TxwEntry {
            skb,
            expiry: now.saturating_add(self.lifetime),
            last_retransmit: 0,
        };
        let key = self.entries.insert(entry);
        let slot = self.slot(self.lead);
        debug_assert!(self.ring[slot].is_none(), "slot collision at {}", self.lead);
        self.ring[slot] = Some(key);
        Ok(self.lead)
    }

    /// Copy caller-owned bytes into a pooled buffer and push.
    pub fn push_copy(
        &mut self,
        data: &[u8],
        fragment: Option<FragmentInfo>,
        now: PgmTime,
    ) -> Result<u32> {
        if data.len() > self.max_tpdu {
            return Err(PgmError::TooLong {
                length: data.len(),
                max: self.max_tpdu,
            });
        }
        let mut buf = self.pool.alloc();
        buf.extend_from_slice(data);
        let skb = SkBuff {
            tsi: self.tsi,
            sequence: 0, // assigned by push
            tstamp: now,
            fragment,
            payload: buf.freeze(),
        };
        self.push(skb, now)
    }

    /// Borrow the packet at `sqn` without removing it.
    pub fn peek(&self, sqn: u32) -> Result<&SkBuff> {
        if self.is_empty() || !sn::in_range(sqn, self.trail, self.lead) {
            return Err(PgmError::OutOfWindow(sqn));
        }
        match self.ring[self.slot(sqn)] {
            Some(key) => {
                let entry = &self.entries[key];
                debug_assert_eq!(entry.skb.sequence, sqn);
                Ok(&entry.skb)
            }
            None => Err(PgmError::OutOfWindow(sqn)),
        }
    }

    /// Fetch the packet at `sqn` for repair, recording the transmission.
    /// Returns `Ok(None)` when a repair for this sequence already went out
    /// within `suppress_ivl` — NAKs from many receivers for one loss need
    /// only one RDATA.
    pub fn peek_for_repair(
        &mut self,
        sqn: u32,
        now: PgmTime,
        suppress_ivl: PgmTime,
    ) -> Result<Option<&SkBuff>> {
        if self.is_empty() || !sn::in_range(sqn, self.trail, self.lead) {
            return Err(PgmError::OutOfWindow(sqn));
        }
        match self.ring[self.slot(sqn)] {
            Some(key) => {
                let entry = &mut self.entries[key];
                if entry.last_retransmit != 0
                    && now.saturating_sub(entry.last_retransmit) < suppress_ivl
                {
                    return Ok(None);
                }
                entry.last_retransmit = now;
                Ok(Some(&entry.skb))
            }
            None => Err(PgmError::OutOfWindow(sqn)),
        }
    }

    /// Retire trail entries whose lifetime has lapsed. Only meaningful for
    /// rate-sized windows; sequence-sized windows never expire entries.
    pub fn retire_expired(&mut self, now: PgmTime) -> u32 {
        if self.lifetime == 0 {
            return 0;
        }
        let mut retired = 0;
        while !self.is_empty() {
            let slot = self.slot(self.trail);
            let expired = match self.ring[slot] {
                Some(key) => self.entries[key].expiry <= now,
                None => true,
            };
            if !expired {
                break;
            }
            self.pop();
            retired += 1;
        }
        if retired > 0 {
            tracing::trace!(retired, trail = self.trail, "retired aged packets");
        }
        retired
    }

    /// Retire the trail entry, returning its buffer to the pool.
    fn pop(&mut self) {
        if self.is_empty() {
            return;
        }
        let slot = self.slot(self.trail);
        if let Some(key) = self.ring[slot].take() {
            let entry = self.entries.remove(key);
            self.pool.release(entry.skb.payload);
        }
        self.trail = self.trail.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsi::Gsi;

    fn test_tsi() -> Tsi {
        Tsi::new(Gsi::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]), 9000)
    }

    /// Window whose first push is assigned sequence 0.
    fn zero_based(sqns: u32) -> TransmitWindow {
        let config = TxwConfig {
            sqns,
            initial_sequence: Some(u32::MAX),
            preallocate: 4,
            ..TxwConfig::default()
        };
        TransmitWindow::new(&config, test_tsi()).unwrap()
    }

    fn payload(tag: u8) -> Vec<u8> {
        vec![tag; 10]
    }

    // ─── Sizing ─────────────────────────────────────────────────────────

    #[test]
    fn capacity_from_sqns() {
        let config = TxwConfig {
            sqns: 32,
            ..TxwConfig::default()
        };
        assert_eq!(config.capacity().unwrap(), 32);
    }

    #[test]
    fn capacity_from_rate() {
        // 2 s × 24000 B/s ÷ 1500 B = 32 sequences.
        let config = TxwConfig {
            sqns: 0,
            secs: 2,
            max_rte: 24_000,
            max_tpdu: 1500,
            ..TxwConfig::default()
        };
        assert_eq!(config.capacity().unwrap(), 32);
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let config = TxwConfig {
            sqns: 100,
            ..TxwConfig::default()
        };
        assert_eq!(config.capacity().unwrap(), 128);
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = TxwConfig {
            sqns: 0,
            secs: 0,
            max_rte: 0,
            ..TxwConfig::default()
        };
        assert!(matches!(config.capacity(), Err(PgmError::Config(_))));
    }

    // ─── Push / peek ────────────────────────────────────────────────────

    #[test]
    fn push_and_peek_ten() {
        let mut txw = zero_based(32);
        assert!(txw.is_empty());

        for i in 0u8..10 {
            let sqn = txw.push_copy(&payload(i), None, 0).unwrap();
            assert_eq!(sqn, i as u32);
        }

        assert_eq!(txw.trail(), 0);
        assert_eq!(txw.lead(), 9);
        assert_eq!(txw.len(), 10);
        assert_eq!(&txw.peek(5).unwrap().payload[..], &payload(5)[..]);
    }

    #[test]
    fn peek_is_bit_identical() {
        let mut txw = zero_based(32);
        let data: Vec<u8> = (0..200).map(|i| (i * 7) as u8).collect();
        let sqn = txw.push_copy(&data, None, 0).unwrap();
        assert_eq!(&txw.peek(sqn).unwrap().payload[..], &data[..]);
    }

    #[test]
    fn wrap_and_overwrite() {
        let mut txw = zero_based(4);
        for i in 0u8..6 {
            txw.push_copy(&payload(i), None, 0).unwrap();
        }

        assert_eq!(txw.trail(), 2);
        assert_eq!(txw.lead(), 5);
        assert_eq!(txw.forced_advances(), 2);
        assert!(matches!(txw.peek(1), Err(PgmError::OutOfWindow(1))));
        assert_eq!(&txw.peek(2).unwrap().payload[..], &payload(2)[..]);
    }

    #[test]
    fn density_over_occupied_range() {
        let mut txw = zero_based(8);
        for i in 0u8..20 {
            txw.push_copy(&payload(i), None, 0).unwrap();
        }
        let (trail, lead) = (txw.trail(), txw.lead());
        let mut sqn = trail;
        loop {
            assert_eq!(txw.peek(sqn).unwrap().sequence, sqn);
            if sqn == lead {
                break;
            }
            sqn = sqn.wrapping_add(1);
        }
    }

    #[test]
    fn peek_empty_window_is_error() {
        let txw = zero_based(8);
        assert!(matches!(txw.peek(0), Err(PgmError::OutOfWindow(0))));
    }

    #[test]
    fn oversize_push_rejected() {
        let mut txw = zero_based(8);
        let big = vec![0u8; txw.max_tpdu + 1];
        assert!(matches!(
            txw.push_copy(&big, None, 0),
            Err(PgmError::TooLong { .. })
        ));
        assert!(txw.is_empty(), "failed push must not consume a sequence");
    }

    #[test]
    fn sequence_wraparound() {
        let config = TxwConfig {
            sqns: 32,
            initial_sequence: Some(u32::MAX - 2),
            ..TxwConfig::default()
        };
        let mut txw = TransmitWindow::new(&config, test_tsi()).unwrap();

        let first = txw.push_copy(&payload(1), None, 0).unwrap();
        let second = txw.push_copy(&payload(2), None, 0).unwrap();
        assert_eq!(first, u32::MAX - 1);
        assert_eq!(second, u32::MAX);
        let third = txw.push_copy(&payload(3), None, 0).unwrap();
        assert_eq!(third, 0, "sequence wraps to zero");

        assert_eq!(&txw.peek(u32::MAX - 1).unwrap().payload[..], &payload(1)[..]);
        assert_eq!(&txw.peek(0).unwrap().payload[..], &payload(3)[..]);
    }

    #[test]
    fn next_lead_does_not_mutate() {
        let mut txw = zero_based(8);
        txw.push_copy(&payload(0), None, 0).unwrap();
        assert_eq!(txw.next_lead(), 1);
        assert_eq!(txw.next_lead(), 1);
        assert_eq!(txw.lead(), 0);
    }

    #[test]
    fn buffers_conserved_across_lapping() {
        let mut txw = zero_based(4);
        for i in 0u8..32 {
            txw.push_copy(&payload(i), None, 0).unwrap();
        }
        // Window holds exactly capacity buffers; everything popped went
        // back to the pool.
        assert_eq!(txw.buffers_held(), 4);
    }

    #[test]
    fn repair_suppressed_within_interval() {
        let mut txw = zero_based(8);
        let sqn = txw.push_copy(&payload(0), None, 100).unwrap();

        let first = txw.peek_for_repair(sqn, 500, 1_000).unwrap();
        assert!(first.is_some(), "first repair goes out");
        let second = txw.peek_for_repair(sqn, 900, 1_000).unwrap();
        assert!(second.is_none(), "second NAK within interval elided");
        let third = txw.peek_for_repair(sqn, 2_000, 1_000).unwrap();
        assert!(third.is_some(), "repair allowed after interval");
    }

    #[test]
    fn rate_sized_window_retires_by_age() {
        let config = TxwConfig {
            sqns: 0,
            secs: 1, // 1 s lifetime
            max_rte: 12_000,
            max_tpdu: 1500,
            initial_sequence: Some(u32::MAX),
            ..TxwConfig::default()
        };
        let mut txw = TransmitWindow::new(&config, test_tsi()).unwrap();

        txw.push_copy(&payload(0), None, 0).unwrap();
        txw.push_copy(&payload(1), None, 600_000).unwrap();

        assert_eq!(txw.retire_expired(500_000), 0, "nothing aged yet");
        assert_eq!(txw.retire_expired(1_100_000), 1, "first packet aged out");
        assert_eq!(txw.trail(), 1);
        assert_eq!(txw.retire_expired(2_000_000), 1);
        assert!(txw.is_empty());
    }
}
