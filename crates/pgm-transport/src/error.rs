//! Error taxonomy for the transport core.
//!
//! Malformed packets and duplicates are absorbed where they are detected
//! (counted, logged at `trace!`/`warn!`, never surfaced); everything else
//! propagates as a [`PgmError`].

use thiserror::Error;

/// Errors surfaced by the public transport and window operations.
#[derive(Debug, Error)]
pub enum PgmError {
    /// Invalid option value or option combination.
    #[error("configuration: {0}")]
    Config(String),

    /// Address resolution or socket binding failure.
    #[error("address: {0}")]
    Address(String),

    /// Socket-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed packet. Absorbed by the receive path; only decode helpers
    /// return it directly.
    #[error("malformed packet: {0}")]
    Protocol(&'static str),

    /// Sequence number outside the window.
    #[error("sequence {0} not in window")]
    OutOfWindow(u32),

    /// Payload too large for the configured TPDU size.
    #[error("length {length} exceeds max TPDU payload {max}")]
    TooLong { length: usize, max: usize },

    /// Buffer pool exhausted beyond its growth limit.
    #[error("buffer pool exhausted")]
    Resource,

    /// Operation not permitted in the transport's current state.
    #[error("operation invalid in {0} state")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, PgmError>;
