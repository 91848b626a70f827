//! # Receive Window
//!
//! Pure logic — no I/O, no global clock. One window per sender session:
//! reorders arriving data, turns sequence gaps into NAK schedules,
//! reassembles fragmented APDUs and hands the application strictly
//! in-order batches, each entry either a complete APDU or a loss
//! indication for a run the repair machinery gave up on.
//!
//! ## Slot life cycle
//!
//! ```text
//!                 gap seen                data           commit scan
//!   (vacant) ───────────────▶ PLACEHOLDER ────▶ DATA ───────────────▶ COMMITTED ──▶ read
//!                                │                ▲                        │
//!                                │ fragment       │ group complete         ▼
//!                                ├──────▶ INCOMPLETE                    (vacant)
//!                                │
//!                                │ NAK retries exhausted / forced advance
//!                                ▼
//!                              LOST ──▶ read (loss indication)
//! ```
//!
//! A placeholder runs the NAK machine: back-off with uniform jitter, then
//! wait-for-NCF with bounded repeats, then wait-for-repair-data with
//! bounded repeats, then LOST. Deadlines are absolute microseconds; the
//! owner drives them through [`ReceiveWindow::timer_tick`] and realises
//! the returned actions on the wire.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use rand::RngExt;

use crate::error::{PgmError, Result};
use crate::pool::{FragmentInfo, SkBuff};
use crate::sn;
use crate::time::PgmTime;
use crate::tsi::Tsi;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Receive window parameters. Intervals are microseconds.
#[derive(Debug, Clone)]
pub struct RxwConfig {
    /// Maximum TPDU size; larger TSDUs are malformed.
    pub max_tpdu: usize,
    /// Window capacity in sequences.
    pub sqns: u32,
    /// Initial NAK back-off; actual delay is uniform in `[0, nak_bo_ivl]`.
    pub nak_bo_ivl: PgmTime,
    /// NAK repeat interval while waiting for an NCF.
    pub nak_rpt_ivl: PgmTime,
    /// Wait for repair data after an NCF.
    pub nak_rdata_ivl: PgmTime,
    /// Repeats in wait-data before the sequence is declared lost.
    pub nak_data_retries: u32,
    /// Repeats in wait-NCF before the sequence is declared lost.
    pub nak_ncf_retries: u32,
}

impl Default for RxwConfig {
    fn default() -> Self {
        RxwConfig {
            max_tpdu: 1500,
            sqns: 256,
            nak_bo_ivl: 50_000,
            nak_rpt_ivl: 200_000,
            nak_rdata_ivl: 200_000,
            nak_data_retries: 5,
            nak_ncf_retries: 5,
        }
    }
}

impl RxwConfig {
    /// Resolve the window capacity, rounded up to a power of two so the
    /// slot mapping `sqn % capacity` stays injective across the sequence
    /// wrap.
    pub fn capacity(&self) -> Result<u32> {
        if self.sqns == 0 {
            return Err(PgmError::Config("rxw_sqns must be positive".into()));
        }
        if self.sqns > 1 << 30 {
            return Err(PgmError::Config(format!(
                "window of {} sequences exceeds the 2^30 bound",
                self.sqns
            )));
        }
        Ok(self.sqns.next_power_of_two())
    }
}

// ─── NAK state machine ──────────────────────────────────────────────────────

/// Repair phase of a missing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakPhase {
    /// Jittered delay before the first NAK, so a multicast group does not
    /// NAK in unison.
    BackOff,
    /// NAK sent, waiting for the source to confirm.
    WaitNcf,
    /// Confirmed, waiting for repair data.
    WaitData,
}

#[derive(Debug, Clone, Copy)]
struct NakState {
    phase: NakPhase,
    deadline: PgmTime,
    ncf_retries: u32,
    data_retries: u32,
}

/// Wire work the owner must realise after a timer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// (Re-)send a NAK for this sequence.
    SendNak { sequence: u32 },
    /// The sequence was declared unrecoverable.
    Lost { sequence: u32 },
}

// ─── Slots ──────────────────────────────────────────────────────────────────

enum RxSlot {
    Vacant,
    Placeholder(NakState),
    /// Fragment present, APDU not yet complete.
    Incomplete(SkBuff),
    /// Deliverable data (single-TSDU APDU, or member of a complete group).
    Data(SkBuff),
    /// Promoted by the commit scan; drained by `read`.
    Committed(SkBuff),
    Lost,
    /// Malformed; arrivals for this sequence are ignored.
    Error,
}

/// Externally visible slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Placeholder,
    Incomplete,
    Data,
    Committed,
    Lost,
    Error,
}

enum GroupStatus {
    /// All fragments present and consistent; `0` is the last sequence.
    Complete(u32),
    /// Still waiting on fragments.
    Waiting,
    /// The group can never complete.
    Dead { error: bool },
}

// ─── Messages ───────────────────────────────────────────────────────────────

/// One entry of a `read` batch.
#[derive(Debug, Clone)]
pub enum Msgv {
    /// A complete APDU; fragment buffers in sequence order.
    Apdu { first_sqn: u32, fragments: Vec<Bytes> },
    /// A run of sequences the window gave up on.
    Loss { first_sqn: u32, count: u32 },
}

impl Msgv {
    /// Payload bytes carried (zero for a loss indication).
    pub fn byte_len(&self) -> usize {
        match self {
            Msgv::Apdu { fragments, .. } => fragments.iter().map(Bytes::len).sum(),
            Msgv::Loss { .. } => 0,
        }
    }
}

// ─── Window ─────────────────────────────────────────────────────────────────

/// The receive window for one sender session.
pub struct ReceiveWindow {
    slots: Vec<RxSlot>,
    capacity: u32,
    config: RxwConfig,
    peer: Tsi,
    /// Window edges are meaningless until the first packet or SPM.
    defined: bool,
    /// Lowest undelivered sequence; slots below are vacant.
    commit_trail: u32,
    /// Repair boundary; never below `commit_trail`.
    trail: u32,
    /// Highest sequence seen (or advertised).
    lead: u32,
    /// Last trailing edge advertised by the source.
    rxw_trail: u32,
    /// Loss runs force-advanced out of the ring, pending delivery.
    pending_loss: VecDeque<(u32, u32)>,
    /// Fragment groups in progress: first sequence → APDU length.
    reassembly: HashMap<u32, u32>,
    duplicates: u64,
    malformed: u64,
    late: u64,
    lost_sqns: u64,
    delivered: u64,
}

impl ReceiveWindow {
    pub fn new(config: RxwConfig, peer: Tsi) -> Result<Self> {
        let capacity = config.capacity()?;
        tracing::debug!(%peer, capacity, "receive window created");
        Ok(ReceiveWindow {
            slots: (0..capacity).map(|_| RxSlot::Vacant).collect(),
            capacity,
            config,
            peer,
            defined: false,
            commit_trail: 0,
            trail: 0,
            lead: 0,
            rxw_trail: 0,
            pending_loss: VecDeque::new(),
            reassembly: HashMap::new(),
            duplicates: 0,
            malformed: 0,
            late: 0,
            lost_sqns: 0,
            delivered: 0,
        })
    }

    // ─── Reporters ──────────────────────────────────────────────────────

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn lead(&self) -> u32 {
        self.lead
    }

    pub fn trail(&self) -> u32 {
        self.trail
    }

    pub fn commit_trail(&self) -> u32 {
        self.commit_trail
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Arrivals for sequences already declared lost.
    pub fn late_arrivals(&self) -> u64 {
        self.late
    }

    /// Sequences declared unrecoverable so far.
    pub fn lost_sequences(&self) -> u64 {
        self.lost_sqns
    }

    /// APDUs handed to the application.
    pub fn apdus_delivered(&self) -> u64 {
        self.delivered
    }

    /// State of the slot at `sqn`, if it is inside the window.
    pub fn slot_state(&self, sqn: u32) -> Option<SlotState> {
        if !self.defined || !sn::in_range(sqn, self.commit_trail, self.lead) {
            return None;
        }
        match &self.slots[self.idx(sqn)] {
            RxSlot::Vacant => None,
            RxSlot::Placeholder(_) => Some(SlotState::Placeholder),
            RxSlot::Incomplete(_) => Some(SlotState::Incomplete),
            RxSlot::Data(_) => Some(SlotState::Data),
            RxSlot::Committed(_) => Some(SlotState::Committed),
            RxSlot::Lost => Some(SlotState::Lost),
            RxSlot::Error => Some(SlotState::Error),
        }
    }

    /// NAK phase of the placeholder at `sqn`, if any.
    pub fn nak_phase(&self, sqn: u32) -> Option<NakPhase> {
        if !self.defined || !sn::in_range(sqn, self.commit_trail, self.lead) {
            return None;
        }
        match &self.slots[self.idx(sqn)] {
            RxSlot::Placeholder(nak) => Some(nak.phase),
            _ => None,
        }
    }

    /// Earliest pending NAK deadline.
    pub fn next_deadline(&self) -> Option<PgmTime> {
        if !self.defined {
            return None;
        }
        let mut min: Option<PgmTime> = None;
        let mut q = self.commit_trail;
        while sn::lte(q, self.lead) {
            if let RxSlot::Placeholder(nak) = &self.slots[self.idx(q)] {
                min = Some(min.map_or(nak.deadline, |m: PgmTime| m.min(nak.deadline)));
            }
            q = q.wrapping_add(1);
        }
        min
    }

    fn idx(&self, sqn: u32) -> usize {
        (sqn % self.capacity) as usize
    }

    // ─── Insertion ──────────────────────────────────────────────────────

    /// Primary insertion point for ODATA / RDATA.
    ///
    /// Malformed packets and duplicates are absorbed: counted, logged,
    /// never surfaced.
    pub fn add(&mut self, skb: SkBuff, now: PgmTime) {
        if skb.len() > self.config.max_tpdu {
            self.malformed += 1;
            tracing::warn!(peer = %self.peer, len = skb.len(), "oversize TSDU dropped");
            return;
        }
        if let Some(f) = skb.fragment {
            let len = skb.len() as u32;
            let bad = f.apdu_len == 0
                || f.offset.checked_add(len).map_or(true, |end| end > f.apdu_len)
                || sn::gt(f.first_sqn, skb.sequence)
                || skb.sequence.wrapping_sub(f.first_sqn) >= self.capacity;
            if bad {
                self.malformed += 1;
                tracing::warn!(peer = %self.peer, sqn = skb.sequence, "bad fragment metadata");
                return;
            }
        }

        let s = skb.sequence;
        if !self.defined {
            self.define(s);
        } else if sn::lt(s, self.commit_trail) {
            // Below the delivery edge: obsolete or duplicate.
            self.duplicates += 1;
            return;
        }

        if sn::lte(s, self.lead) {
            match &self.slots[self.idx(s)] {
                RxSlot::Placeholder(_) | RxSlot::Vacant => {
                    self.insert_data(skb);
                    self.commit_scan();
                }
                RxSlot::Lost => {
                    // Do not un-lose: the loss may already be reported.
                    self.late += 1;
                    tracing::trace!(peer = %self.peer, sqn = s, "arrival for lost sequence");
                }
                RxSlot::Error => {
                    self.late += 1;
                }
                // Duplicate data does not refresh timers or payloads.
                _ => self.duplicates += 1,
            }
        } else {
            self.grow_window(s, now);
            self.insert_data(skb);
            self.commit_scan();
        }
    }

    /// The source advertised a new trailing edge: sequences below it can
    /// no longer be repaired.
    pub fn update_trail(&mut self, peer_trail: u32) {
        if !self.defined {
            self.define(peer_trail);
            return;
        }
        if sn::lte(peer_trail, self.rxw_trail) {
            return; // stale
        }
        self.rxw_trail = peer_trail;

        let mut q = self.commit_trail;
        while sn::lt(q, peer_trail) && sn::lte(q, self.lead) {
            let idx = self.idx(q);
            if let RxSlot::Placeholder(_) = self.slots[idx] {
                self.slots[idx] = RxSlot::Lost;
                self.lost_sqns += 1;
            }
            q = q.wrapping_add(1);
        }
        if sn::lt(self.trail, peer_trail) {
            // Clamp inside the window; the stored advertisement governs
            // placeholder creation beyond it.
            let cap_edge = self.lead.wrapping_add(1);
            self.trail = if sn::lt(peer_trail, cap_edge) {
                peer_trail
            } else {
                cap_edge
            };
        }
        self.commit_scan();
    }

    /// The source advertised its leading edge (via SPM): anything between
    /// our lead and it is missing and NAK-eligible.
    pub fn advertise_lead(&mut self, lead_adv: u32, now: PgmTime) {
        if !self.defined {
            return; // trail advertisement defines the window first
        }
        if sn::lte(lead_adv, self.lead) {
            return;
        }
        self.grow_window(lead_adv, now);
        self.commit_scan();
    }

    /// An NCF arrived for `sqn`: the source has promised repair data.
    pub fn confirm(&mut self, sqn: u32, now: PgmTime) {
        if !self.defined || !sn::in_range(sqn, self.commit_trail, self.lead) {
            return;
        }
        let idx = self.idx(sqn);
        if let RxSlot::Placeholder(nak) = &mut self.slots[idx] {
            nak.phase = NakPhase::WaitData;
            nak.deadline = now.saturating_add(self.config.nak_rdata_ivl);
        }
    }

    /// Drop all state, e.g. on session reset. Counters survive.
    pub fn flush(&mut self) {
        for slot in &mut self.slots {
            *slot = RxSlot::Vacant;
        }
        self.defined = false;
        self.pending_loss.clear();
        self.reassembly.clear();
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Walk due NAK deadlines, advancing the per-sequence repair machine.
    /// The caller realises the returned actions on the wire.
    pub fn timer_tick(&mut self, now: PgmTime) -> Vec<TimerAction> {
        let mut actions = Vec::new();
        if !self.defined {
            return actions;
        }
        let mut q = self.commit_trail;
        while sn::lte(q, self.lead) {
            let idx = self.idx(q);
            if let RxSlot::Placeholder(nak) = &mut self.slots[idx] {
                if now >= nak.deadline {
                    match nak.phase {
                        NakPhase::BackOff => {
                            nak.phase = NakPhase::WaitNcf;
                            nak.deadline = now.saturating_add(self.config.nak_rpt_ivl);
                            actions.push(TimerAction::SendNak { sequence: q });
                        }
                        NakPhase::WaitNcf => {
                            nak.ncf_retries = nak.ncf_retries.saturating_sub(1);
                            if nak.ncf_retries == 0 {
                                self.slots[idx] = RxSlot::Lost;
                                self.lost_sqns += 1;
                                actions.push(TimerAction::Lost { sequence: q });
                            } else {
                                nak.deadline = now.saturating_add(self.config.nak_rpt_ivl);
                                actions.push(TimerAction::SendNak { sequence: q });
                            }
                        }
                        NakPhase::WaitData => {
                            nak.data_retries = nak.data_retries.saturating_sub(1);
                            if nak.data_retries == 0 {
                                self.slots[idx] = RxSlot::Lost;
                                self.lost_sqns += 1;
                                actions.push(TimerAction::Lost { sequence: q });
                            } else {
                                nak.deadline = now.saturating_add(self.config.nak_rdata_ivl);
                                actions.push(TimerAction::SendNak { sequence: q });
                            }
                        }
                    }
                }
            }
            q = q.wrapping_add(1);
        }
        if actions
            .iter()
            .any(|a| matches!(a, TimerAction::Lost { .. }))
        {
            self.commit_scan();
        }
        actions
    }

    // ─── Delivery ───────────────────────────────────────────────────────

    /// Drain committed APDUs and resolved loss runs in sequence order,
    /// appending at most `max_entries` entries. Returns `(entries,
    /// payload_bytes)`. Stops at the first slot still in flight.
    pub fn read(&mut self, msgv: &mut Vec<Msgv>, max_entries: usize) -> (usize, usize) {
        let mut count = 0usize;
        let mut bytes = 0usize;

        // Runs force-advanced out of the ring precede everything resident.
        while count < max_entries {
            match self.pending_loss.pop_front() {
                Some((first_sqn, n)) => {
                    msgv.push(Msgv::Loss {
                        first_sqn,
                        count: n,
                    });
                    count += 1;
                }
                None => break,
            }
        }

        while count < max_entries && self.defined && sn::lte(self.commit_trail, self.lead) {
            let q = self.commit_trail;
            match &self.slots[self.idx(q)] {
                RxSlot::Committed(_) => match self.take_apdu(q) {
                    Some((apdu, len)) => {
                        bytes += len;
                        msgv.push(apdu);
                        self.delivered += 1;
                        count += 1;
                    }
                    None => break,
                },
                RxSlot::Lost | RxSlot::Error => {
                    let mut n = 0u32;
                    while sn::lte(self.commit_trail, self.lead) {
                        let idx = self.idx(self.commit_trail);
                        match self.slots[idx] {
                            RxSlot::Lost | RxSlot::Error => {
                                self.slots[idx] = RxSlot::Vacant;
                                self.commit_trail = self.commit_trail.wrapping_add(1);
                                n += 1;
                            }
                            _ => break,
                        }
                    }
                    msgv.push(Msgv::Loss {
                        first_sqn: q,
                        count: n,
                    });
                    count += 1;
                }
                _ => break,
            }
        }

        if sn::lt(self.trail, self.commit_trail) {
            self.trail = self.commit_trail;
        }
        (count, bytes)
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn define(&mut self, sqn: u32) {
        self.defined = true;
        self.commit_trail = sqn;
        self.trail = sqn;
        self.rxw_trail = sqn;
        self.lead = sqn.wrapping_sub(1);
        tracing::debug!(peer = %self.peer, sqn, "window defined");
    }

    fn backoff_state(&self, now: PgmTime) -> NakState {
        let jitter = rand::rng().random_range(0..=self.config.nak_bo_ivl);
        NakState {
            phase: NakPhase::BackOff,
            deadline: now.saturating_add(jitter),
            ncf_retries: self.config.nak_ncf_retries,
            data_retries: self.config.nak_data_retries,
        }
    }

    /// Advance the leading edge to `new_lead`, filling the gap with
    /// placeholders (or immediate losses for sequences the source no
    /// longer holds). Force-advances the delivery edge first when the new
    /// span would exceed capacity.
    fn grow_window(&mut self, new_lead: u32, now: PgmTime) {
        let new_span = new_lead.wrapping_sub(self.commit_trail).wrapping_add(1);
        if new_span > self.capacity {
            let new_edge = new_lead.wrapping_sub(self.capacity - 1);
            self.force_advance(new_edge);
        }
        let mut q = self.lead.wrapping_add(1);
        while sn::lte(q, new_lead) {
            if sn::gte(q, self.commit_trail) {
                let slot = if sn::lt(q, self.rxw_trail) {
                    // The source no longer holds it: lost on arrival.
                    self.lost_sqns += 1;
                    RxSlot::Lost
                } else {
                    RxSlot::Placeholder(self.backoff_state(now))
                };
                let idx = self.idx(q);
                self.slots[idx] = slot;
            }
            q = q.wrapping_add(1);
        }
        self.lead = new_lead;
    }

    /// Everything below `new_edge` is beyond repair: surface it as one
    /// loss run and free the slots.
    fn force_advance(&mut self, new_edge: u32) {
        let count = new_edge.wrapping_sub(self.commit_trail);
        if count == 0 {
            return;
        }
        let mut q = self.commit_trail;
        while sn::lt(q, new_edge) && sn::lte(q, self.lead) {
            let idx = self.idx(q);
            self.slots[idx] = RxSlot::Vacant;
            q = q.wrapping_add(1);
        }
        tracing::warn!(
            peer = %self.peer,
            first = self.commit_trail,
            count,
            "window overrun, forced advance"
        );
        self.pending_loss.push_back((self.commit_trail, count));
        self.lost_sqns += u64::from(count);
        self.commit_trail = new_edge;
        if sn::lt(self.trail, new_edge) {
            self.trail = new_edge;
        }
        let edge = new_edge;
        self.reassembly.retain(|&first, _| sn::gte(first, edge));
    }

    /// Store arrived data into its slot and advance group bookkeeping.
    fn insert_data(&mut self, skb: SkBuff) {
        let s = skb.sequence;
        let idx = self.idx(s);
        match skb.fragment {
            None => {
                self.slots[idx] = RxSlot::Data(skb);
            }
            Some(f) => {
                match self.reassembly.get(&f.first_sqn) {
                    Some(&len) if len != f.apdu_len => {
                        // Disagreeing fragments poison the whole group.
                        self.malformed += 1;
                        self.slots[idx] = RxSlot::Error;
                        self.kill_group(f.first_sqn, true);
                        return;
                    }
                    Some(_) => {}
                    None => {
                        self.reassembly.insert(f.first_sqn, f.apdu_len);
                    }
                }
                self.slots[idx] = RxSlot::Incomplete(skb);
                match self.group_status(f.first_sqn) {
                    GroupStatus::Complete(last) => self.promote_group(f.first_sqn, last),
                    GroupStatus::Waiting => {}
                    GroupStatus::Dead { error } => self.kill_group(f.first_sqn, error),
                }
            }
        }
    }

    fn slot_fragment(&self, idx: usize) -> Option<(&SkBuff, FragmentInfo)> {
        match &self.slots[idx] {
            RxSlot::Incomplete(skb) | RxSlot::Data(skb) | RxSlot::Committed(skb) => {
                skb.fragment.map(|f| (skb, f))
            }
            _ => None,
        }
    }

    /// Assess a fragment group by walking its members from `first`.
    fn group_status(&self, first: u32) -> GroupStatus {
        let Some(&apdu_len) = self.reassembly.get(&first) else {
            return GroupStatus::Dead { error: false };
        };
        if sn::lt(first, self.commit_trail) {
            return GroupStatus::Dead { error: false };
        }
        let mut acc = 0u32;
        let mut q = first;
        loop {
            if q.wrapping_sub(first) >= self.capacity {
                // Group spans more than the window: unrecoverable.
                return GroupStatus::Dead { error: false };
            }
            if sn::gt(q, self.lead) {
                return GroupStatus::Waiting;
            }
            let idx = self.idx(q);
            match self.slot_fragment(idx) {
                Some((skb, f)) if f.first_sqn == first => {
                    if f.offset != acc {
                        return GroupStatus::Dead { error: true };
                    }
                    acc = acc.saturating_add(skb.len() as u32);
                    if acc == apdu_len {
                        return GroupStatus::Complete(q);
                    }
                    if acc > apdu_len {
                        return GroupStatus::Dead { error: true };
                    }
                }
                _ => {
                    return match &self.slots[idx] {
                        RxSlot::Placeholder(_) | RxSlot::Vacant => GroupStatus::Waiting,
                        RxSlot::Lost => GroupStatus::Dead { error: false },
                        // Foreign data or an error slot inside the group
                        // span: the group is inconsistent.
                        _ => GroupStatus::Dead { error: true },
                    };
                }
            }
            q = q.wrapping_add(1);
        }
    }

    /// All fragments of `[first, last]` are present: promote them to
    /// deliverable.
    fn promote_group(&mut self, first: u32, last: u32) {
        let mut q = first;
        loop {
            let idx = self.idx(q);
            let slot = std::mem::replace(&mut self.slots[idx], RxSlot::Vacant);
            self.slots[idx] = match slot {
                RxSlot::Incomplete(skb) => RxSlot::Data(skb),
                other => other,
            };
            if q == last {
                break;
            }
            q = q.wrapping_add(1);
        }
        self.reassembly.remove(&first);
    }

    /// The group can never complete: its resident members become LOST (or
    /// ERROR for inconsistent metadata).
    fn kill_group(&mut self, first: u32, error: bool) {
        if error {
            tracing::warn!(peer = %self.peer, first, "inconsistent fragment group dropped");
        }
        let start = if sn::lt(first, self.commit_trail) {
            self.commit_trail
        } else {
            first
        };
        let mut q = start;
        while sn::lte(q, self.lead) && q.wrapping_sub(first) < self.capacity {
            let idx = self.idx(q);
            let member = matches!(self.slot_fragment(idx), Some((_, f)) if f.first_sqn == first);
            if member {
                self.slots[idx] = if error { RxSlot::Error } else { RxSlot::Lost };
                self.lost_sqns += 1;
            }
            q = q.wrapping_add(1);
        }
        self.reassembly.remove(&first);
    }

    /// Promote deliverable data at the commit edge, resolving dead groups
    /// on the way. Stops at the first slot still in flight.
    fn commit_scan(&mut self) {
        if !self.defined {
            return;
        }
        let mut q = self.commit_trail;
        while sn::lte(q, self.lead) {
            let idx = self.idx(q);
            match &self.slots[idx] {
                RxSlot::Committed(_) | RxSlot::Lost | RxSlot::Error => {
                    q = q.wrapping_add(1);
                }
                RxSlot::Data(skb) => {
                    let frag = skb.fragment;
                    match frag {
                        None => {
                            self.commit_slot(idx);
                            q = q.wrapping_add(1);
                        }
                        Some(f) => {
                            // Groups are promoted atomically, so the scan
                            // meets them at their first member.
                            if f.first_sqn != q {
                                break;
                            }
                            match self.group_last_member(q) {
                                Some(last) => {
                                    let mut m = q;
                                    loop {
                                        let i = self.idx(m);
                                        self.commit_slot(i);
                                        if m == last {
                                            break;
                                        }
                                        m = m.wrapping_add(1);
                                    }
                                    q = last.wrapping_add(1);
                                }
                                None => break,
                            }
                        }
                    }
                }
                RxSlot::Incomplete(skb) => {
                    let first = match skb.fragment {
                        Some(f) => f.first_sqn,
                        None => break,
                    };
                    match self.group_status(first) {
                        GroupStatus::Complete(last) => {
                            self.promote_group(first, last);
                            // re-examine q, now Data
                        }
                        GroupStatus::Waiting => break,
                        GroupStatus::Dead { error } => {
                            self.kill_group(first, error);
                            // re-examine q, now Lost/Error
                        }
                    }
                }
                RxSlot::Placeholder(_) | RxSlot::Vacant => break,
            }
        }
    }

    /// Last member of the complete, already-promoted group starting at
    /// `first`; `None` if a member is unexpectedly missing.
    fn group_last_member(&self, first: u32) -> Option<u32> {
        let mut acc = 0u32;
        let mut q = first;
        loop {
            let idx = self.idx(q);
            let (skb, f) = self.slot_fragment(idx)?;
            if f.first_sqn != first {
                return None;
            }
            acc = acc.saturating_add(skb.len() as u32);
            if acc >= f.apdu_len {
                return Some(q);
            }
            q = q.wrapping_add(1);
            if q.wrapping_sub(first) >= self.capacity {
                return None;
            }
        }
    }

    /// Move the deliverable slot at `idx` to committed.
    fn commit_slot(&mut self, idx: usize) {
        if let RxSlot::Data(skb) = std::mem::replace(&mut self.slots[idx], RxSlot::Vacant) {
            self.slots[idx] = RxSlot::Committed(skb);
        }
    }

    /// Detach the committed APDU starting at `sqn` and advance the edge.
    fn take_apdu(&mut self, sqn: u32) -> Option<(Msgv, usize)> {
        let idx = self.idx(sqn);
        let first = match std::mem::replace(&mut self.slots[idx], RxSlot::Vacant) {
            RxSlot::Committed(skb) => skb,
            other => {
                self.slots[idx] = other;
                return None;
            }
        };
        self.commit_trail = sqn.wrapping_add(1);

        match first.fragment {
            None => {
                let len = first.payload.len();
                Some((
                    Msgv::Apdu {
                        first_sqn: sqn,
                        fragments: vec![first.payload],
                    },
                    len,
                ))
            }
            Some(f) => {
                let mut fragments = vec![first.payload];
                let mut acc: usize = fragments[0].len();
                while (acc as u32) < f.apdu_len {
                    let q = self.commit_trail;
                    let i = self.idx(q);
                    match std::mem::replace(&mut self.slots[i], RxSlot::Vacant) {
                        RxSlot::Committed(skb) => {
                            acc += skb.payload.len();
                            fragments.push(skb.payload);
                            self.commit_trail = q.wrapping_add(1);
                        }
                        other => {
                            // Committed groups are contiguous; nothing else
                            // can appear inside one.
                            self.slots[i] = other;
                            break;
                        }
                    }
                }
                Some((
                    Msgv::Apdu {
                        first_sqn: sqn,
                        fragments,
                    },
                    acc,
                ))
            }
        }
    }
}
