//! # pgm-transport
//!
//! Pure-Rust core of PGM (Pragmatic General Multicast): reliable,
//! NAK-repaired delivery over native or UDP-encapsulated IP multicast.
//!
//! Reliability lives in two bounded sequence-indexed rings — the transmit
//! window retains sent packets for repair, the receive window reorders,
//! schedules NAKs for gaps, reassembles fragmented APDUs and delivers
//! strictly in order. A transport binds them to a socket and a timer
//! loop that the caller drives from their own event loop.
//!
//! ## Crate structure
//!
//! - [`sn`] — mod-2³² serial-number arithmetic
//! - [`time`] — process-wide monotonic microsecond clock
//! - [`tsi`] — session identity (GSI + source port)
//! - [`pool`] — packet buffers and slab reuse
//! - [`wire`] — PGM packet codec (SPM, ODATA, RDATA, NAK, NCF, SPMR)
//! - [`txw`] — transmit window
//! - [`rxw`] — receive window and the NAK state machine
//! - [`transport`] — socket binding, peers, timers, send/receive
//! - [`stats`] — source and peer counters
//! - [`error`] — error taxonomy

pub mod error;
pub mod pool;
pub mod rxw;
pub mod sn;
pub mod stats;
pub mod time;
pub mod transport;
pub mod tsi;
pub mod txw;
pub mod wire;

pub use error::PgmError;
pub use transport::{IoStatus, Message, SessionInfo, Transport, TransportOption};
pub use tsi::{Gsi, Tsi};
