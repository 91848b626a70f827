//! # PGM Wire Format
//!
//! UDP-encapsulated PGM packet codec. Every TPDU opens with a fixed
//! 18-byte header followed by a type-specific body:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Source Port           |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |    Options    |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Global Source ID (8 bytes)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Global Source ID (continued)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          TSDU Length          |          body ...             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is the 16-bit ones' complement of the ones' complement sum
//! over the entire TPDU, computed with the checksum field zeroed.
//!
//! The source port, destination port and GSI are the same on every packet
//! of a session regardless of direction — a NAK names the session it asks
//! repair for, so `tsi()` is well-defined on all packet kinds.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgmError, Result};
use crate::pool::FragmentInfo;
use crate::tsi::{Gsi, Tsi, GSI_LEN};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Fixed header size: ports (4) + type (1) + options (1) + checksum (2)
/// + GSI (8) + TSDU length (2).
pub const PGM_HEADER_LEN: usize = 8 + GSI_LEN + 2;

/// Fixed data body prefix: sequence (4) + trailing edge (4).
pub const DATA_BODY_LEN: usize = 8;

/// SPM body: SPM sequence (4) + trail (4) + lead (4).
pub const SPM_BODY_LEN: usize = 12;

/// Fragment option: first sequence (4) + offset (4) + APDU length (4).
pub const FRAGMENT_OPT_LEN: usize = 12;

/// Maximum sequences in one NAK / NCF list.
pub const MAX_NAK_LIST: usize = 63;

/// Options bit: a fragment option follows the data body prefix.
const OPT_FRAGMENT: u8 = 0x01;

// ─── Packet kind ────────────────────────────────────────────────────────────

/// PGM packet types handled by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Source path message — heartbeat advertising the transmit window.
    Spm = 0x00,
    /// Original data.
    OriginalData = 0x04,
    /// Repair data (retransmission).
    RepairData = 0x05,
    /// Negative acknowledgement.
    Nak = 0x08,
    /// NAK confirmation.
    NakConfirm = 0x0A,
    /// Solicitation for an immediate SPM.
    SpmRequest = 0x0C,
}

impl PacketKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PacketKind::Spm),
            0x04 => Some(PacketKind::OriginalData),
            0x05 => Some(PacketKind::RepairData),
            0x08 => Some(PacketKind::Nak),
            0x0A => Some(PacketKind::NakConfirm),
            0x0C => Some(PacketKind::SpmRequest),
            _ => None,
        }
    }
}

// ─── Checksum ───────────────────────────────────────────────────────────────

fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [b] = chunks.remainder() {
        sum += u32::from(*b) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Compute the header checksum for a serialised TPDU whose checksum field
/// is zero.
pub fn checksum(packet: &[u8]) -> u16 {
    !ones_complement_sum(packet)
}

/// Validate the checksum of a received TPDU.
pub fn verify_checksum(packet: &[u8]) -> bool {
    ones_complement_sum(packet) == 0xFFFF
}

// ─── Bodies ─────────────────────────────────────────────────────────────────

/// ODATA / RDATA body: sequence, advertised trailing edge, optional
/// fragment metadata, TSDU payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sequence: u32,
    pub trail: u32,
    pub fragment: Option<FragmentInfo>,
    pub tsdu: Bytes,
}

/// SPM body: heartbeat sequence plus the transmit window edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpmPacket {
    pub spm_sqn: u32,
    pub trail: u32,
    pub lead: u32,
}

/// NAK / NCF body: the sequences being reported or confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPacket {
    pub sqns: Vec<u32>,
}

/// Decoded type-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Spm(SpmPacket),
    SpmRequest,
    OriginalData(DataPacket),
    RepairData(DataPacket),
    Nak(NakPacket),
    NakConfirm(NakPacket),
}

// ─── Packet ─────────────────────────────────────────────────────────────────

/// A complete PGM TPDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgmPacket {
    pub sport: u16,
    pub dport: u16,
    pub gsi: Gsi,
    pub body: PacketBody,
}

impl PgmPacket {
    pub fn kind(&self) -> PacketKind {
        match &self.body {
            PacketBody::Spm(_) => PacketKind::Spm,
            PacketBody::SpmRequest => PacketKind::SpmRequest,
            PacketBody::OriginalData(_) => PacketKind::OriginalData,
            PacketBody::RepairData(_) => PacketKind::RepairData,
            PacketBody::Nak(_) => PacketKind::Nak,
            PacketBody::NakConfirm(_) => PacketKind::NakConfirm,
        }
    }

    /// The session this packet belongs to.
    pub fn tsi(&self) -> Tsi {
        Tsi::new(self.gsi, self.sport)
    }

    fn data(&self) -> Option<&DataPacket> {
        match &self.body {
            PacketBody::OriginalData(d) | PacketBody::RepairData(d) => Some(d),
            _ => None,
        }
    }

    /// Serialise the TPDU, checksum applied.
    pub fn encode(&self) -> BytesMut {
        let tsdu_len = self.data().map(|d| d.tsdu.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN + SPM_BODY_LEN + tsdu_len);

        let mut options = 0u8;
        if self.data().is_some_and(|d| d.fragment.is_some()) {
            options |= OPT_FRAGMENT;
        }

        buf.put_u16(self.sport);
        buf.put_u16(self.dport);
        buf.put_u8(self.kind() as u8);
        buf.put_u8(options);
        buf.put_u16(0); // checksum, patched below
        buf.put_slice(self.gsi.as_bytes());
        buf.put_u16(tsdu_len as u16);

        match &self.body {
            PacketBody::Spm(spm) => {
                buf.put_u32(spm.spm_sqn);
                buf.put_u32(spm.trail);
                buf.put_u32(spm.lead);
            }
            PacketBody::SpmRequest => {}
            PacketBody::OriginalData(d) | PacketBody::RepairData(d) => {
                buf.put_u32(d.sequence);
                buf.put_u32(d.trail);
                if let Some(f) = &d.fragment {
                    buf.put_u32(f.first_sqn);
                    buf.put_u32(f.offset);
                    buf.put_u32(f.apdu_len);
                }
                buf.put_slice(&d.tsdu);
            }
            PacketBody::Nak(nak) | PacketBody::NakConfirm(nak) => {
                debug_assert!(!nak.sqns.is_empty() && nak.sqns.len() <= MAX_NAK_LIST);
                buf.put_u8(nak.sqns.len() as u8);
                for &sqn in &nak.sqns {
                    buf.put_u32(sqn);
                }
            }
        }

        let sum = checksum(&buf);
        buf[6..8].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    /// Parse a TPDU. Never panics on truncated or hostile input.
    pub fn decode(raw: &[u8]) -> Result<PgmPacket> {
        if raw.len() < PGM_HEADER_LEN {
            return Err(PgmError::Protocol("short header"));
        }
        if !verify_checksum(raw) {
            return Err(PgmError::Protocol("bad checksum"));
        }

        let mut buf = raw;
        let sport = buf.get_u16();
        let dport = buf.get_u16();
        let kind =
            PacketKind::from_byte(buf.get_u8()).ok_or(PgmError::Protocol("unknown type"))?;
        let options = buf.get_u8();
        let _checksum = buf.get_u16();
        let mut gsi = [0u8; GSI_LEN];
        buf.copy_to_slice(&mut gsi);
        let gsi = Gsi::from_bytes(gsi);
        let tsdu_len = buf.get_u16() as usize;

        let body = match kind {
            PacketKind::Spm => {
                if buf.remaining() < SPM_BODY_LEN {
                    return Err(PgmError::Protocol("short SPM"));
                }
                PacketBody::Spm(SpmPacket {
                    spm_sqn: buf.get_u32(),
                    trail: buf.get_u32(),
                    lead: buf.get_u32(),
                })
            }
            PacketKind::SpmRequest => PacketBody::SpmRequest,
            PacketKind::OriginalData | PacketKind::RepairData => {
                if buf.remaining() < DATA_BODY_LEN {
                    return Err(PgmError::Protocol("short data body"));
                }
                let sequence = buf.get_u32();
                let trail = buf.get_u32();
                let fragment = if options & OPT_FRAGMENT != 0 {
                    if buf.remaining() < FRAGMENT_OPT_LEN {
                        return Err(PgmError::Protocol("short fragment option"));
                    }
                    Some(FragmentInfo {
                        first_sqn: buf.get_u32(),
                        offset: buf.get_u32(),
                        apdu_len: buf.get_u32(),
                    })
                } else {
                    None
                };
                if buf.remaining() != tsdu_len {
                    return Err(PgmError::Protocol("TSDU length mismatch"));
                }
                let data = DataPacket {
                    sequence,
                    trail,
                    fragment,
                    tsdu: Bytes::copy_from_slice(buf),
                };
                match kind {
                    PacketKind::OriginalData => PacketBody::OriginalData(data),
                    _ => PacketBody::RepairData(data),
                }
            }
            PacketKind::Nak | PacketKind::NakConfirm => {
                if !buf.has_remaining() {
                    return Err(PgmError::Protocol("empty NAK"));
                }
                let count = buf.get_u8() as usize;
                if count == 0 || count > MAX_NAK_LIST {
                    return Err(PgmError::Protocol("bad NAK list length"));
                }
                if buf.remaining() != count * 4 {
                    return Err(PgmError::Protocol("NAK list length mismatch"));
                }
                let mut sqns = Vec::with_capacity(count);
                for _ in 0..count {
                    sqns.push(buf.get_u32());
                }
                let nak = NakPacket { sqns };
                match kind {
                    PacketKind::Nak => PacketBody::Nak(nak),
                    _ => PacketBody::NakConfirm(nak),
                }
            }
        };

        Ok(PgmPacket {
            sport,
            dport,
            gsi,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gsi() -> Gsi {
        Gsi::from_bytes([10, 20, 30, 40, 50, 60, 70, 80])
    }

    fn packet(body: PacketBody) -> PgmPacket {
        PgmPacket {
            sport: 7500,
            dport: 7501,
            gsi: test_gsi(),
            body,
        }
    }

    // ─── Roundtrips ─────────────────────────────────────────────────────

    #[test]
    fn odata_roundtrip() {
        let pkt = packet(PacketBody::OriginalData(DataPacket {
            sequence: 42,
            trail: 10,
            fragment: None,
            tsdu: Bytes::from_static(b"hello multicast"),
        }));
        let encoded = pkt.encode();
        let decoded = PgmPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.kind(), PacketKind::OriginalData);
        assert_eq!(decoded.tsi(), Tsi::new(test_gsi(), 7500));
    }

    #[test]
    fn rdata_with_fragment_roundtrip() {
        let pkt = packet(PacketBody::RepairData(DataPacket {
            sequence: 100,
            trail: 90,
            fragment: Some(FragmentInfo {
                first_sqn: 99,
                offset: 1400,
                apdu_len: 4200,
            }),
            tsdu: Bytes::from_static(&[0xAB; 64]),
        }));
        let decoded = PgmPacket::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn spm_roundtrip() {
        let pkt = packet(PacketBody::Spm(SpmPacket {
            spm_sqn: 7,
            trail: 1000,
            lead: 1031,
        }));
        let decoded = PgmPacket::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn spmr_roundtrip() {
        let pkt = packet(PacketBody::SpmRequest);
        let decoded = PgmPacket::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn nak_and_ncf_roundtrip() {
        let nak = packet(PacketBody::Nak(NakPacket {
            sqns: vec![5, 6, 7, 100],
        }));
        assert_eq!(PgmPacket::decode(&nak.encode()).unwrap(), nak);

        let ncf = packet(PacketBody::NakConfirm(NakPacket { sqns: vec![5] }));
        assert_eq!(PgmPacket::decode(&ncf.encode()).unwrap(), ncf);
    }

    #[test]
    fn empty_tsdu_roundtrip() {
        let pkt = packet(PacketBody::OriginalData(DataPacket {
            sequence: 0,
            trail: 0,
            fragment: None,
            tsdu: Bytes::new(),
        }));
        let decoded = PgmPacket::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded, pkt);
    }

    // ─── Validation ─────────────────────────────────────────────────────

    #[test]
    fn corrupted_payload_fails_checksum() {
        let pkt = packet(PacketBody::OriginalData(DataPacket {
            sequence: 1,
            trail: 0,
            fragment: None,
            tsdu: Bytes::from_static(b"payload"),
        }));
        let mut encoded = pkt.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            PgmPacket::decode(&encoded),
            Err(PgmError::Protocol("bad checksum"))
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        let pkt = packet(PacketBody::SpmRequest);
        let encoded = pkt.encode();
        for len in 0..PGM_HEADER_LEN {
            assert!(PgmPacket::decode(&encoded[..len]).is_err());
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let pkt = packet(PacketBody::SpmRequest);
        let mut encoded = pkt.encode();
        encoded[4] = 0x3F; // no such type
        // Re-checksum so the type check is what fails.
        encoded[6..8].copy_from_slice(&[0, 0]);
        let sum = checksum(&encoded);
        encoded[6..8].copy_from_slice(&sum.to_be_bytes());
        assert!(matches!(
            PgmPacket::decode(&encoded),
            Err(PgmError::Protocol("unknown type"))
        ));
    }

    #[test]
    fn tsdu_length_mismatch_rejected() {
        let pkt = packet(PacketBody::OriginalData(DataPacket {
            sequence: 1,
            trail: 0,
            fragment: None,
            tsdu: Bytes::from_static(b"four"),
        }));
        let mut encoded = pkt.encode();
        // Claim a shorter TSDU than is present.
        encoded[16..18].copy_from_slice(&2u16.to_be_bytes());
        encoded[6..8].copy_from_slice(&[0, 0]);
        let sum = checksum(&encoded);
        encoded[6..8].copy_from_slice(&sum.to_be_bytes());
        assert!(PgmPacket::decode(&encoded).is_err());
    }

    #[test]
    fn checksum_detects_single_bit_flips_in_header() {
        let pkt = packet(PacketBody::Spm(SpmPacket {
            spm_sqn: 1,
            trail: 2,
            lead: 3,
        }));
        let encoded = pkt.encode();
        for byte in 0..encoded.len() {
            let mut copy = encoded.clone();
            copy[byte] ^= 0x01;
            assert!(
                !verify_checksum(&copy),
                "bit flip at byte {byte} went undetected"
            );
        }
    }
}
