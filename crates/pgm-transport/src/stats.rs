//! # Transport Statistics
//!
//! Source-side and per-peer counters, serialisable for JSON export or
//! scraping. All counters are monotonic over a transport's lifetime.

use serde::Serialize;

// ─── Source ─────────────────────────────────────────────────────────────────

/// Send-path counters for the local source session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    /// ODATA packets sent (fragments count individually).
    pub packets_sent: u64,
    /// TSDU payload bytes sent.
    pub bytes_sent: u64,
    /// RDATA repairs sent in response to NAKs.
    pub repairs_sent: u64,
    /// NAKs received from the group.
    pub naks_received: u64,
    /// NAKs that asked for sequences outside the transmit window.
    pub naks_out_of_window: u64,
    /// NCF confirmations sent.
    pub ncfs_sent: u64,
    /// SPM heartbeats sent.
    pub spms_sent: u64,
    /// Sends rejected by the rate limiter.
    pub rate_limited: u64,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair traffic relative to original data.
    pub fn repair_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.repairs_sent as f64 / self.packets_sent as f64
        }
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

/// Receive-path counters for one sender session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    /// Data packets received, duplicates included.
    pub packets_received: u64,
    /// TSDU payload bytes received.
    pub bytes_received: u64,
    /// APDUs delivered to the application.
    pub apdus_delivered: u64,
    /// Duplicate data packets.
    pub duplicates: u64,
    /// Malformed packets dropped.
    pub malformed: u64,
    /// Arrivals for sequences already declared lost.
    pub late_arrivals: u64,
    /// Sequences declared unrecoverable.
    pub lost_sequences: u64,
    /// NAKs sent towards the source.
    pub naks_sent: u64,
    /// NCF confirmations received.
    pub ncfs_received: u64,
    /// SPM heartbeats received.
    pub spms_received: u64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of sequences given up on.
    pub fn loss_ratio(&self) -> f64 {
        let seen = self.packets_received + self.lost_sequences;
        if seen == 0 {
            0.0
        } else {
            self.lost_sequences as f64 / seen as f64
        }
    }

    /// Fraction of received packets that were duplicates.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.packets_received as f64
        }
    }
}
