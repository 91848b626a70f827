//! # Transport
//!
//! Owns the socket, one transmit window, the per-sender receive windows
//! and the timer work that stitches them together. Callers drive it from
//! their own event loop: [`Transport::poll_info`] exposes the readable fd
//! and the next timer deadline, and every [`Transport::recvmsgv`] pass
//! drains the socket, advances due timers and returns whatever became
//! deliverable.
//!
//! ## Life cycle
//!
//! ```text
//!   create() ──▶ CREATED ──bind()──▶ BOUND ──close()──▶ CLOSED
//!                  │ set()                │ send()/recvmsgv()
//! ```
//!
//! Options are only writable in `CREATED`; anything else is rejected with
//! a state error. There are no hidden threads — all window mutation
//! happens on the calling thread (one transport per thread; distinct
//! transports are independent).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{PgmError, Result};
use crate::pool::{FragmentInfo, SkBuff};
use crate::rxw::{Msgv, ReceiveWindow, RxwConfig, TimerAction};
use crate::sn;
use crate::stats::{PeerStats, SourceStats};
use crate::time::{self, PgmTime};
use crate::tsi::{Gsi, Tsi};
use crate::txw::{TransmitWindow, TxwConfig};
use crate::wire::{
    DataPacket, NakPacket, PacketBody, PgmPacket, SpmPacket, DATA_BODY_LEN, FRAGMENT_OPT_LEN,
    MAX_NAK_LIST, PGM_HEADER_LEN,
};

// ─── Status codes ───────────────────────────────────────────────────────────

/// Result classification for `send`/`recvmsgv`, mirroring the classic PGM
/// I/O status vocabulary (NORMAL, AGAIN, AGAIN2, RESET, FIN, ABORT, EOF,
/// ERROR, plus the send-side rate limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Data was transferred.
    Normal,
    /// Nothing to do; wait for the socket to become readable.
    WouldBlock,
    /// Nothing to do, but a timer deadline is pending — wait no longer
    /// than [`PollInfo::timeout`].
    TimerPending,
    /// The rate limiter refused the send; retry after
    /// [`Transport::rate_remaining`].
    RateLimited,
    /// A peer was reset and its undelivered data flushed.
    Reset,
    /// The transport closed cleanly.
    Finished,
    /// A peer reset aborted the session (`abort_on_reset`).
    Aborted,
    /// The transport is closed; no more data will arrive.
    EndOfStream,
    /// I/O or state failure; details in the log.
    Failed,
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Transport tunables. Writable only before `bind`. Intervals are
/// microseconds.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_tpdu: usize,
    /// Transmit window size in sequences; 0 selects `txw_secs × txw_max_rte`.
    pub txw_sqns: u32,
    pub txw_secs: u32,
    /// Maximum transmit rate, bytes/second; also drives the rate limiter.
    pub txw_max_rte: u32,
    /// Receive window size per peer.
    pub rxw_sqns: u32,
    /// Multicast TTL / hop limit.
    pub hops: u8,
    /// Deliver our own group traffic locally.
    pub multicast_loop: bool,
    /// Non-blocking socket mode.
    pub nonblocking: bool,
    /// Idle time before a peer is dropped.
    pub peer_expiry: PgmTime,
    /// Back-off before soliciting an SPM from a source known only by data.
    pub spmr_expiry: PgmTime,
    /// Ambient SPM heartbeat interval.
    pub spm_ambient_ivl: PgmTime,
    pub nak_bo_ivl: PgmTime,
    pub nak_rpt_ivl: PgmTime,
    pub nak_rdata_ivl: PgmTime,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    /// Surface a peer reset as `Aborted` instead of `Reset`.
    pub abort_on_reset: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_tpdu: 1500,
            txw_sqns: 0,
            txw_secs: 30,
            txw_max_rte: 400_000,
            rxw_sqns: 256,
            hops: 16,
            multicast_loop: false,
            nonblocking: true,
            peer_expiry: 300_000_000,
            spmr_expiry: 250_000,
            spm_ambient_ivl: 2_000_000,
            nak_bo_ivl: 50_000,
            nak_rpt_ivl: 200_000,
            nak_rdata_ivl: 200_000,
            nak_data_retries: 5,
            nak_ncf_retries: 5,
            abort_on_reset: false,
        }
    }
}

/// One recognised option, applied via [`Transport::set`] in `CREATED`.
#[derive(Debug, Clone, Copy)]
pub enum TransportOption {
    MaxTpdu(usize),
    TxwSqns(u32),
    TxwSecs(u32),
    TxwMaxRte(u32),
    RxwSqns(u32),
    Hops(u8),
    MulticastLoop(bool),
    Nonblocking(bool),
    PeerExpiry(PgmTime),
    SpmrExpiry(PgmTime),
    SpmAmbientIvl(PgmTime),
    NakBoIvl(PgmTime),
    NakRptIvl(PgmTime),
    NakRdataIvl(PgmTime),
    NakDataRetries(u32),
    NakNcfRetries(u32),
    AbortOnReset(bool),
}

/// Addresses a transport binds and sends to. Resolution is the caller's
/// concern; the transport takes concrete addresses.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Our global source identifier.
    pub gsi: Gsi,
    /// Data-destination port of the session.
    pub dport: u16,
    /// Multicast group (or a unicast peer for UDP-encapsulated tests).
    pub group: Ipv4Addr,
    /// Local bind address.
    pub local: Ipv4Addr,
    /// Local UDP encapsulation port (0 for ephemeral).
    pub udp_encap_ucast_port: u16,
    /// Group UDP encapsulation port.
    pub udp_encap_mcast_port: u16,
}

/// Readable fd plus the next deadline, for event-loop integration.
#[derive(Debug, Clone, Copy)]
pub struct PollInfo {
    pub fd: RawFd,
    /// Absolute deadline of the nearest timer, PGM microseconds.
    pub next_deadline: Option<PgmTime>,
    /// Time remaining until that deadline.
    pub timeout: Option<Duration>,
}

/// One delivered entry: which session it came from plus the payload or
/// loss indication.
#[derive(Debug, Clone)]
pub struct Message {
    pub tsi: Tsi,
    pub data: Msgv,
}

// ─── Rate limiter ───────────────────────────────────────────────────────────

/// Token bucket over wire bytes, refilled from `txw_max_rte`.
struct TokenBucket {
    /// Bytes per second; 0 disables limiting.
    rate: u64,
    burst: u64,
    tokens: u64,
    last: PgmTime,
}

impl TokenBucket {
    fn new(rate: u64, burst: u64) -> Self {
        TokenBucket {
            rate,
            burst,
            tokens: burst,
            last: 0,
        }
    }

    fn refill(&mut self, now: PgmTime) {
        if self.rate == 0 {
            return;
        }
        let add = now.saturating_sub(self.last) * self.rate / 1_000_000;
        if add > 0 {
            self.tokens = (self.tokens + add).min(self.burst);
            self.last = now;
        }
    }

    fn try_consume(&mut self, bytes: u64, now: PgmTime) -> bool {
        if self.rate == 0 {
            return true;
        }
        self.refill(now);
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    /// Time until `bytes` tokens will be available.
    fn time_until(&self, bytes: u64, now: PgmTime) -> PgmTime {
        if self.rate == 0 {
            return 0;
        }
        let have = {
            let add = now.saturating_sub(self.last) * self.rate / 1_000_000;
            (self.tokens + add).min(self.burst)
        };
        if have >= bytes {
            0
        } else {
            (bytes - have) * 1_000_000 / self.rate
        }
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

struct Peer {
    rxw: ReceiveWindow,
    last_packet: PgmTime,
    last_addr: SocketAddr,
    /// Highest SPM sequence seen; older SPMs are stale.
    spm_sqn: u32,
    has_spm: bool,
    /// Armed when the peer is known only from data: solicit an SPM once.
    spmr_deadline: Option<PgmTime>,
    stats: PeerStats,
}

// ─── Transport ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Bound,
    Closed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Created => "created",
            State::Bound => "bound",
            State::Closed => "closed",
        }
    }
}

/// A PGM transport endpoint: source and receiver in one.
pub struct Transport {
    state: State,
    fin_reported: bool,
    config: TransportConfig,
    info: SessionInfo,
    tsi: Tsi,
    socket: Option<UdpSocket>,
    txw: Option<TransmitWindow>,
    peers: HashMap<Tsi, Peer>,
    rate: TokenBucket,
    spm_sqn: u32,
    next_spm: PgmTime,
    pending_reset: Vec<Tsi>,
    stats: SourceStats,
    /// Received TPDUs that failed to decode (unknown session).
    undecodable: u64,
    recv_buf: Vec<u8>,
}

impl Transport {
    /// Create a transport in `CREATED` state with default options.
    pub fn create(info: SessionInfo) -> Result<Self> {
        time::init();
        let sport = rand::random();
        let tsi = Tsi::new(info.gsi, sport);
        tracing::debug!(%tsi, group = %info.group, "transport created");
        Ok(Transport {
            state: State::Created,
            fin_reported: false,
            config: TransportConfig::default(),
            info,
            tsi,
            socket: None,
            txw: None,
            peers: HashMap::new(),
            rate: TokenBucket::new(0, 0),
            spm_sqn: 0,
            next_spm: 0,
            pending_reset: Vec::new(),
            stats: SourceStats::new(),
            undecodable: 0,
            recv_buf: Vec::new(),
        })
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// TPDUs received that failed checksum or parse.
    pub fn undecodable_packets(&self) -> u64 {
        self.undecodable
    }

    /// Snapshot the counters for one peer session.
    pub fn peer_stats(&self, tsi: &Tsi) -> Option<PeerStats> {
        self.peers.get(tsi).map(|peer| PeerStats {
            apdus_delivered: peer.rxw.apdus_delivered(),
            duplicates: peer.rxw.duplicates(),
            malformed: peer.stats.malformed + peer.rxw.malformed(),
            late_arrivals: peer.rxw.late_arrivals(),
            lost_sequences: peer.rxw.lost_sequences(),
            ..peer.stats.clone()
        })
    }

    /// Apply one option. Only legal in `CREATED`.
    pub fn set(&mut self, option: TransportOption) -> Result<()> {
        if self.state != State::Created {
            return Err(PgmError::InvalidState(self.state.name()));
        }
        match option {
            TransportOption::MaxTpdu(v) => {
                let floor = PGM_HEADER_LEN + DATA_BODY_LEN + FRAGMENT_OPT_LEN + 1;
                if v < floor || v > u16::MAX as usize {
                    return Err(PgmError::Config(format!(
                        "max_tpdu {v} outside [{floor}, {}]",
                        u16::MAX
                    )));
                }
                self.config.max_tpdu = v;
            }
            TransportOption::TxwSqns(v) => self.config.txw_sqns = v,
            TransportOption::TxwSecs(v) => self.config.txw_secs = v,
            TransportOption::TxwMaxRte(v) => self.config.txw_max_rte = v,
            TransportOption::RxwSqns(v) => {
                if v == 0 {
                    return Err(PgmError::Config("rxw_sqns must be positive".into()));
                }
                self.config.rxw_sqns = v;
            }
            TransportOption::Hops(v) => self.config.hops = v,
            TransportOption::MulticastLoop(v) => self.config.multicast_loop = v,
            TransportOption::Nonblocking(v) => self.config.nonblocking = v,
            TransportOption::PeerExpiry(v) => self.config.peer_expiry = v,
            TransportOption::SpmrExpiry(v) => self.config.spmr_expiry = v,
            TransportOption::SpmAmbientIvl(v) => {
                if v == 0 {
                    return Err(PgmError::Config("spm_ambient_ivl must be positive".into()));
                }
                self.config.spm_ambient_ivl = v;
            }
            TransportOption::NakBoIvl(v) => self.config.nak_bo_ivl = v,
            TransportOption::NakRptIvl(v) => self.config.nak_rpt_ivl = v,
            TransportOption::NakRdataIvl(v) => self.config.nak_rdata_ivl = v,
            TransportOption::NakDataRetries(v) => self.config.nak_data_retries = v,
            TransportOption::NakNcfRetries(v) => self.config.nak_ncf_retries = v,
            TransportOption::AbortOnReset(v) => self.config.abort_on_reset = v,
        }
        Ok(())
    }

    // ─── Bind ───────────────────────────────────────────────────────────

    /// Resolve windows and sockets; moves to `BOUND`. Further `set` calls
    /// are rejected.
    pub fn bind(&mut self) -> Result<()> {
        if self.state != State::Created {
            return Err(PgmError::InvalidState(self.state.name()));
        }

        let txw_config = TxwConfig {
            max_tpdu: self.config.max_tpdu,
            sqns: self.config.txw_sqns,
            secs: self.config.txw_secs,
            max_rte: self.config.txw_max_rte,
            preallocate: 16,
            initial_sequence: None,
        };
        let txw = TransmitWindow::new(&txw_config, self.tsi)?;

        let bind_addr =
            SocketAddrV4::new(self.info.local, self.info.udp_encap_ucast_port);
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| PgmError::Address(format!("bind {bind_addr}: {e}")))?;
        socket.set_nonblocking(self.config.nonblocking)?;

        // Joining the group is best-effort: interfaces without multicast
        // still work for UDP-encapsulated unicast.
        if let Err(e) = socket.join_multicast_v4(&self.info.group, &Ipv4Addr::UNSPECIFIED) {
            tracing::warn!(group = %self.info.group, "multicast join failed: {e}");
        }
        if let Err(e) = socket.set_multicast_ttl_v4(u32::from(self.config.hops)) {
            tracing::warn!("set multicast TTL failed: {e}");
        }
        if let Err(e) = socket.set_multicast_loop_v4(self.config.multicast_loop) {
            tracing::warn!("set multicast loop failed: {e}");
        }

        let rate = u64::from(self.config.txw_max_rte);
        self.rate = TokenBucket::new(rate, rate.max(self.config.max_tpdu as u64 * 4) / 4);
        self.recv_buf = vec![0u8; self.config.max_tpdu];
        self.socket = Some(socket);
        self.txw = Some(txw);
        self.next_spm = time::update_now();
        self.state = State::Bound;
        tracing::debug!(tsi = %self.tsi, addr = %bind_addr, "transport bound");
        Ok(())
    }

    /// Local socket address once bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.socket {
            Some(socket) => Ok(socket.local_addr()?),
            None => Err(PgmError::InvalidState(self.state.name())),
        }
    }

    /// Readable fd and next timer deadline for the caller's event loop.
    pub fn poll_info(&self) -> Result<PollInfo> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(PgmError::InvalidState(self.state.name()));
        };
        let now = time::now();
        let next_deadline = self.next_deadline();
        Ok(PollInfo {
            fd: socket.as_raw_fd(),
            next_deadline,
            timeout: next_deadline.map(|d| Duration::from_micros(d.saturating_sub(now))),
        })
    }

    /// Time until the rate limiter admits `bytes` more wire bytes.
    pub fn rate_remaining(&self, bytes: usize) -> Duration {
        Duration::from_micros(self.rate.time_until(bytes as u64, time::now()))
    }

    // ─── Send path ──────────────────────────────────────────────────────

    /// Largest TSDU that fits one TPDU.
    fn max_tsdu(&self, fragmented: bool) -> usize {
        let overhead = PGM_HEADER_LEN
            + DATA_BODY_LEN
            + if fragmented { FRAGMENT_OPT_LEN } else { 0 };
        self.config.max_tpdu - overhead
    }

    /// Send one APDU, fragmenting as needed. Every fragment is retained
    /// in the transmit window for NAK-driven repair.
    pub fn send(&mut self, data: &[u8]) -> IoStatus {
        if self.state != State::Bound {
            tracing::warn!(state = self.state.name(), "send in wrong state");
            return match self.state {
                State::Closed => IoStatus::EndOfStream,
                _ => IoStatus::Failed,
            };
        }
        if data.len() > u32::MAX as usize {
            tracing::warn!(len = data.len(), "APDU too large");
            return IoStatus::Failed;
        }

        let now = time::update_now();
        let single = self.max_tsdu(false);
        let fragmented = data.len() > single;
        let chunk_size = if fragmented { self.max_tsdu(true) } else { single };
        let chunks = if data.is_empty() {
            1
        } else {
            data.len().div_ceil(chunk_size)
        };

        // One admission decision per APDU.
        let wire_bytes = (data.len()
            + chunks
                * (PGM_HEADER_LEN + DATA_BODY_LEN + if fragmented { FRAGMENT_OPT_LEN } else { 0 }))
            as u64;
        if !self.rate.try_consume(wire_bytes, now) {
            self.stats.rate_limited += 1;
            return IoStatus::RateLimited;
        }

        let first_sqn = match &self.txw {
            Some(txw) => txw.next_lead(),
            None => return IoStatus::Failed,
        };

        for i in 0..chunks {
            let chunk = &data[i * chunk_size..data.len().min((i + 1) * chunk_size)];
            let fragment = fragmented.then_some(FragmentInfo {
                first_sqn,
                offset: (i * chunk_size) as u32,
                apdu_len: data.len() as u32,
            });
            match self.send_odata(chunk, fragment, now) {
                Ok(()) => {}
                Err(PgmError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                    // The fragment is in the window; receivers recover it
                    // through NAK repair once later data exposes the gap.
                    tracing::debug!("socket backpressure mid-APDU");
                    return IoStatus::WouldBlock;
                }
                Err(e) => {
                    tracing::warn!("send failed: {e}");
                    return IoStatus::Failed;
                }
            }
        }
        IoStatus::Normal
    }

    fn send_odata(
        &mut self,
        chunk: &[u8],
        fragment: Option<FragmentInfo>,
        now: PgmTime,
    ) -> Result<()> {
        let Some(txw) = self.txw.as_mut() else {
            return Err(PgmError::InvalidState(self.state.name()));
        };
        let sequence = txw.push_copy(chunk, fragment, now)?;
        let trail = txw.trail();
        let tsdu = txw.peek(sequence)?.payload.clone();

        let packet = PgmPacket {
            sport: self.tsi.sport,
            dport: self.info.dport,
            gsi: self.tsi.gsi,
            body: PacketBody::OriginalData(DataPacket {
                sequence,
                trail,
                fragment,
                tsdu,
            }),
        };
        self.send_to_group(&packet)?;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += chunk.len() as u64;
        Ok(())
    }

    fn group_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.info.group, self.info.udp_encap_mcast_port)
    }

    fn send_to_group(&self, packet: &PgmPacket) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(PgmError::InvalidState(self.state.name()));
        };
        socket.send_to(&packet.encode(), self.group_addr())?;
        Ok(())
    }

    fn send_to_addr(&self, packet: &PgmPacket, addr: SocketAddr) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(PgmError::InvalidState(self.state.name()));
        };
        socket.send_to(&packet.encode(), addr)?;
        Ok(())
    }

    // ─── Receive path ───────────────────────────────────────────────────

    /// Drain the socket, run due timers and collect deliverable messages.
    /// Non-blocking; returns `(status, entries, payload_bytes)`.
    pub fn recvmsgv(
        &mut self,
        msgv: &mut Vec<Message>,
        max_entries: usize,
    ) -> (IoStatus, usize, usize) {
        match self.state {
            State::Bound => {}
            State::Closed => {
                return if self.fin_reported {
                    (IoStatus::EndOfStream, 0, 0)
                } else {
                    self.fin_reported = true;
                    (IoStatus::Finished, 0, 0)
                };
            }
            State::Created => {
                tracing::warn!("recvmsgv before bind");
                return (IoStatus::Failed, 0, 0);
            }
        }

        let now = time::update_now();

        // 1. Socket drain.
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return (IoStatus::Failed, 0, 0);
            };
            match socket.recv_from(&mut self.recv_buf) {
                Ok((len, addr)) => match PgmPacket::decode(&self.recv_buf[..len]) {
                    Ok(packet) => self.on_packet(packet, addr, now),
                    Err(e) => {
                        self.undecodable += 1;
                        tracing::trace!(%addr, "undecodable TPDU: {e}");
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("recv failed: {e}");
                    return (IoStatus::Failed, 0, 0);
                }
            }
        }

        // 2. Timers.
        self.pump_timers(now);

        // 3. Peer resets trump data delivery.
        if let Some(tsi) = self.pending_reset.pop() {
            tracing::warn!(%tsi, "peer reset");
            return if self.config.abort_on_reset {
                (IoStatus::Aborted, 0, 0)
            } else {
                (IoStatus::Reset, 0, 0)
            };
        }

        // 4. Drain receive windows. No inter-peer ordering is promised.
        let mut count = 0usize;
        let mut bytes = 0usize;
        let mut batch = Vec::new();
        for (tsi, peer) in self.peers.iter_mut() {
            if count >= max_entries {
                break;
            }
            batch.clear();
            let (c, b) = peer.rxw.read(&mut batch, max_entries - count);
            for data in batch.drain(..) {
                msgv.push(Message { tsi: *tsi, data });
            }
            count += c;
            bytes += b;
        }
        peer_stats_refresh(&mut self.peers);

        if count > 0 {
            (IoStatus::Normal, count, bytes)
        } else if self.next_deadline().is_some() {
            (IoStatus::TimerPending, 0, 0)
        } else {
            (IoStatus::WouldBlock, 0, 0)
        }
    }

    fn on_packet(&mut self, packet: PgmPacket, addr: SocketAddr, now: PgmTime) {
        let tsi = packet.tsi();
        match packet.body {
            PacketBody::OriginalData(data) | PacketBody::RepairData(data) => {
                if tsi == self.tsi {
                    return; // our own group traffic looped back
                }
                self.on_data(tsi, data, addr, now);
            }
            PacketBody::Spm(spm) => {
                if tsi == self.tsi {
                    return;
                }
                self.on_spm(tsi, spm, addr, now);
            }
            PacketBody::Nak(nak) => self.on_nak(tsi, nak, now),
            PacketBody::NakConfirm(ncf) => self.on_ncf(tsi, ncf, now),
            PacketBody::SpmRequest => self.on_spmr(tsi, now),
        }
    }

    fn peer_entry(&mut self, tsi: Tsi, addr: SocketAddr, now: PgmTime) -> Result<&mut Peer> {
        if !self.peers.contains_key(&tsi) {
            let rxw_config = RxwConfig {
                max_tpdu: self.config.max_tpdu,
                sqns: self.config.rxw_sqns,
                nak_bo_ivl: self.config.nak_bo_ivl,
                nak_rpt_ivl: self.config.nak_rpt_ivl,
                nak_rdata_ivl: self.config.nak_rdata_ivl,
                nak_data_retries: self.config.nak_data_retries,
                nak_ncf_retries: self.config.nak_ncf_retries,
            };
            let rxw = ReceiveWindow::new(rxw_config, tsi)?;
            tracing::debug!(%tsi, %addr, "new peer");
            self.peers.insert(
                tsi,
                Peer {
                    rxw,
                    last_packet: now,
                    last_addr: addr,
                    spm_sqn: 0,
                    has_spm: false,
                    spmr_deadline: Some(now.saturating_add(self.config.spmr_expiry)),
                    stats: PeerStats::new(),
                },
            );
        }
        self.peers
            .get_mut(&tsi)
            .ok_or(PgmError::Resource)
    }

    fn on_data(&mut self, tsi: Tsi, data: DataPacket, addr: SocketAddr, now: PgmTime) {
        let reset_jump = {
            let Ok(peer) = self.peer_entry(tsi, addr, now) else {
                return;
            };
            peer.last_packet = now;
            peer.last_addr = addr;
            peer.stats.packets_received += 1;
            peer.stats.bytes_received += data.tsdu.len() as u64;

            // A sequence leap far outside the window, or a trailing edge
            // that moved backwards, signals a restarted source.
            let bound = u64::from(peer.rxw.capacity()) * 8;
            peer.rxw.is_defined()
                && (sn::gt(data.sequence, peer.rxw.lead())
                    && u64::from(data.sequence.wrapping_sub(peer.rxw.lead())) > bound
                    || sn::lt(data.trail, peer.rxw.trail())
                        && u64::from(peer.rxw.trail().wrapping_sub(data.trail)) > bound)
        };

        if reset_jump {
            if let Some(peer) = self.peers.get_mut(&tsi) {
                peer.rxw.flush();
            }
            self.pending_reset.push(tsi);
        }

        if let Some(peer) = self.peers.get_mut(&tsi) {
            peer.rxw.update_trail(data.trail);
            peer.rxw.add(
                SkBuff {
                    tsi,
                    sequence: data.sequence,
                    tstamp: now,
                    fragment: data.fragment,
                    payload: data.tsdu,
                },
                now,
            );
        }
    }

    fn on_spm(&mut self, tsi: Tsi, spm: SpmPacket, addr: SocketAddr, now: PgmTime) {
        let Ok(peer) = self.peer_entry(tsi, addr, now) else {
            return;
        };
        peer.last_packet = now;
        peer.last_addr = addr;
        if peer.has_spm && !sn::gt(spm.spm_sqn, peer.spm_sqn) {
            return; // stale or duplicate heartbeat
        }
        peer.has_spm = true;
        peer.spm_sqn = spm.spm_sqn;
        peer.spmr_deadline = None;
        peer.stats.spms_received += 1;
        peer.rxw.update_trail(spm.trail);
        peer.rxw.advertise_lead(spm.lead, now);
    }

    /// We are the source: answer a NAK with NCF + RDATA.
    fn on_nak(&mut self, tsi: Tsi, nak: NakPacket, now: PgmTime) {
        if tsi != self.tsi {
            return; // repair request for some other session
        }
        self.stats.naks_received += 1;

        let suppress = self.config.nak_rdata_ivl / 2;
        let mut confirmed = Vec::new();
        let mut repairs = Vec::new();
        {
            let Some(txw) = self.txw.as_mut() else {
                return;
            };
            for &sqn in &nak.sqns {
                match txw.peek_for_repair(sqn, now, suppress) {
                    Ok(Some(skb)) => {
                        confirmed.push(sqn);
                        repairs.push((sqn, skb.fragment, skb.payload.clone()));
                    }
                    Ok(None) => confirmed.push(sqn), // repair already in flight
                    Err(_) => {
                        self.stats.naks_out_of_window += 1;
                        tracing::warn!(sqn, "NAK outside transmit window");
                    }
                }
            }
        }

        for chunk in confirmed.chunks(MAX_NAK_LIST) {
            let ncf = PgmPacket {
                sport: self.tsi.sport,
                dport: self.info.dport,
                gsi: self.tsi.gsi,
                body: PacketBody::NakConfirm(NakPacket {
                    sqns: chunk.to_vec(),
                }),
            };
            if self.send_to_group(&ncf).is_ok() {
                self.stats.ncfs_sent += 1;
            }
        }

        let trail = self.txw.as_ref().map(|t| t.trail()).unwrap_or(0);
        for (sequence, fragment, tsdu) in repairs {
            let rdata = PgmPacket {
                sport: self.tsi.sport,
                dport: self.info.dport,
                gsi: self.tsi.gsi,
                body: PacketBody::RepairData(DataPacket {
                    sequence,
                    trail,
                    fragment,
                    tsdu,
                }),
            };
            if self.send_to_group(&rdata).is_ok() {
                self.stats.repairs_sent += 1;
            }
        }
    }

    /// We are a receiver: the source promised repair for these sequences.
    fn on_ncf(&mut self, tsi: Tsi, ncf: NakPacket, now: PgmTime) {
        if let Some(peer) = self.peers.get_mut(&tsi) {
            peer.last_packet = now;
            peer.stats.ncfs_received += 1;
            for &sqn in &ncf.sqns {
                peer.rxw.confirm(sqn, now);
            }
        }
    }

    fn on_spmr(&mut self, tsi: Tsi, now: PgmTime) {
        if tsi == self.tsi {
            // A receiver wants our session parameters right away.
            self.send_spm(now);
        } else if let Some(peer) = self.peers.get_mut(&tsi) {
            // Another receiver beat us to it; ours is redundant.
            peer.spmr_deadline = None;
        }
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    fn send_spm(&mut self, now: PgmTime) {
        let Some(txw) = self.txw.as_ref() else {
            return;
        };
        let spm = PgmPacket {
            sport: self.tsi.sport,
            dport: self.info.dport,
            gsi: self.tsi.gsi,
            body: PacketBody::Spm(SpmPacket {
                spm_sqn: self.spm_sqn,
                trail: txw.trail(),
                lead: txw.lead(),
            }),
        };
        if self.send_to_group(&spm).is_ok() {
            self.spm_sqn = self.spm_sqn.wrapping_add(1);
            self.stats.spms_sent += 1;
            self.next_spm = now.saturating_add(self.config.spm_ambient_ivl);
        }
    }

    fn pump_timers(&mut self, now: PgmTime) {
        if now >= self.next_spm {
            self.send_spm(now);
        }
        if let Some(txw) = self.txw.as_mut() {
            txw.retire_expired(now);
        }

        // Gather wire work per peer first; sending borrows the socket.
        let mut outgoing: Vec<(PgmPacket, SocketAddr)> = Vec::new();
        let mut expired: Vec<Tsi> = Vec::new();
        let dport = self.info.dport;
        let peer_expiry = self.config.peer_expiry;

        for (tsi, peer) in self.peers.iter_mut() {
            if now.saturating_sub(peer.last_packet) > peer_expiry {
                expired.push(*tsi);
                continue;
            }

            if let Some(deadline) = peer.spmr_deadline {
                if now >= deadline {
                    peer.spmr_deadline = None;
                    outgoing.push((
                        PgmPacket {
                            sport: tsi.sport,
                            dport,
                            gsi: tsi.gsi,
                            body: PacketBody::SpmRequest,
                        },
                        peer.last_addr,
                    ));
                }
            }

            let actions = peer.rxw.timer_tick(now);
            let mut nak_sqns = Vec::new();
            for action in actions {
                match action {
                    TimerAction::SendNak { sequence } => nak_sqns.push(sequence),
                    TimerAction::Lost { sequence } => {
                        tracing::debug!(%tsi, sequence, "sequence declared lost");
                    }
                }
            }
            for chunk in nak_sqns.chunks(MAX_NAK_LIST) {
                peer.stats.naks_sent += 1;
                outgoing.push((
                    PgmPacket {
                        sport: tsi.sport,
                        dport,
                        gsi: tsi.gsi,
                        body: PacketBody::Nak(NakPacket {
                            sqns: chunk.to_vec(),
                        }),
                    },
                    peer.last_addr,
                ));
            }
        }

        for tsi in expired {
            tracing::debug!(%tsi, "peer expired");
            self.peers.remove(&tsi);
        }
        for (packet, addr) in outgoing {
            if let Err(e) = self.send_to_addr(&packet, addr) {
                tracing::warn!(%addr, "control send failed: {e}");
            }
        }
    }

    /// Nearest pending deadline across SPM, SPMR and NAK timers.
    fn next_deadline(&self) -> Option<PgmTime> {
        let mut min: Option<PgmTime> = None;
        let mut fold = |d: PgmTime| {
            min = Some(min.map_or(d, |m: PgmTime| m.min(d)));
        };
        if self.state == State::Bound {
            fold(self.next_spm);
        }
        for peer in self.peers.values() {
            if let Some(d) = peer.spmr_deadline {
                fold(d);
            }
            if let Some(d) = peer.rxw.next_deadline() {
                fold(d);
            }
        }
        min
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Close the transport. With `flush`, a final SPM advertises the
    /// window edges so receivers can finish repairs they already hold.
    pub fn close(&mut self, flush: bool) {
        if self.state == State::Bound && flush {
            self.send_spm(time::update_now());
        }
        self.peers.clear();
        self.txw = None;
        self.socket = None;
        if self.state != State::Closed {
            tracing::debug!(tsi = %self.tsi, "transport closed");
        }
        self.state = State::Closed;
    }

    /// Close and consume the transport.
    pub fn destroy(mut self, flush: bool) {
        self.close(flush);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.state == State::Bound {
            self.close(false);
        }
    }
}

/// Fold window counters into the per-peer wire counters after a drain.
fn peer_stats_refresh(peers: &mut HashMap<Tsi, Peer>) {
    for peer in peers.values_mut() {
        peer.stats.apdus_delivered = peer.rxw.apdus_delivered();
        peer.stats.duplicates = peer.rxw.duplicates();
        peer.stats.lost_sequences = peer.rxw.lost_sequences();
        peer.stats.late_arrivals = peer.rxw.late_arrivals();
    }
}
