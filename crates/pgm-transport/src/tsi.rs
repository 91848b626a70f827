//! # Transport Session Identification
//!
//! A PGM session is identified on the wire by its TSI: the sender's global
//! source identifier plus its data-source port. Every packet of a session
//! carries the same TSI, and receivers key their per-sender state on it.

use std::fmt;

use rand::RngExt;

/// Length of a global source identifier in bytes.
pub const GSI_LEN: usize = 8;

/// Length of a TSI on the wire: GSI plus 16-bit source port.
pub const TSI_LEN: usize = GSI_LEN + 2;

// ─── GSI ────────────────────────────────────────────────────────────────────

/// Global Source Identifier — an opaque 8-byte value unique to a sender.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gsi([u8; GSI_LEN]);

impl Gsi {
    /// Construct from raw bytes.
    pub const fn from_bytes(bytes: [u8; GSI_LEN]) -> Self {
        Gsi(bytes)
    }

    /// Generate a random GSI. Collision probability across a deployment is
    /// negligible at 64 bits.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; GSI_LEN];
        rng.fill(&mut bytes[..]);
        Gsi(bytes)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; GSI_LEN] {
        &self.0
    }
}

impl fmt::Display for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{b}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gsi({self})")
    }
}

// ─── TSI ────────────────────────────────────────────────────────────────────

/// Transport Session Identifier: `{GSI, source port}`.
///
/// Equality and hashing cover all ten bytes, so a sender that restarts with
/// a fresh source port is a distinct session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub const fn new(gsi: Gsi, sport: u16) -> Self {
        Tsi { gsi, sport }
    }
}

impl fmt::Display for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}

impl fmt::Debug for Tsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tsi({self})")
    }
}
