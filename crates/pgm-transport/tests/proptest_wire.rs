//! # Property tests: wire codec and serial arithmetic
//!
//! The codec must round-trip every representable packet and survive
//! arbitrary hostile bytes without panicking; the serial-number
//! comparisons must satisfy the mod-2³² ordering laws for every distance
//! inside the window bound.

use bytes::Bytes;
use proptest::prelude::*;

use pgm_transport::pool::FragmentInfo;
use pgm_transport::sn;
use pgm_transport::tsi::Gsi;
use pgm_transport::wire::{
    DataPacket, NakPacket, PacketBody, PgmPacket, SpmPacket, MAX_NAK_LIST,
};

// ─── Strategies ─────────────────────────────────────────────────────────────

fn gsi_strategy() -> impl Strategy<Value = Gsi> {
    any::<[u8; 8]>().prop_map(Gsi::from_bytes)
}

fn fragment_strategy() -> impl Strategy<Value = Option<FragmentInfo>> {
    proptest::option::of((any::<u32>(), any::<u32>(), any::<u32>()).prop_map(
        |(first_sqn, offset, apdu_len)| FragmentInfo {
            first_sqn,
            offset,
            apdu_len,
        },
    ))
}

fn data_body_strategy() -> impl Strategy<Value = PacketBody> {
    (
        any::<u32>(),
        any::<u32>(),
        fragment_strategy(),
        proptest::collection::vec(any::<u8>(), 0..512),
        any::<bool>(),
    )
        .prop_map(|(sequence, trail, fragment, tsdu, repair)| {
            let data = DataPacket {
                sequence,
                trail,
                fragment,
                tsdu: Bytes::from(tsdu),
            };
            if repair {
                PacketBody::RepairData(data)
            } else {
                PacketBody::OriginalData(data)
            }
        })
}

fn nak_body_strategy() -> impl Strategy<Value = PacketBody> {
    (
        proptest::collection::vec(any::<u32>(), 1..=MAX_NAK_LIST),
        any::<bool>(),
    )
        .prop_map(|(sqns, confirm)| {
            let nak = NakPacket { sqns };
            if confirm {
                PacketBody::NakConfirm(nak)
            } else {
                PacketBody::Nak(nak)
            }
        })
}

fn body_strategy() -> impl Strategy<Value = PacketBody> {
    prop_oneof![
        data_body_strategy(),
        nak_body_strategy(),
        (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(spm_sqn, trail, lead)| {
            PacketBody::Spm(SpmPacket {
                spm_sqn,
                trail,
                lead,
            })
        }),
        Just(PacketBody::SpmRequest),
    ]
}

fn packet_strategy() -> impl Strategy<Value = PgmPacket> {
    (any::<u16>(), any::<u16>(), gsi_strategy(), body_strategy()).prop_map(
        |(sport, dport, gsi, body)| PgmPacket {
            sport,
            dport,
            gsi,
            body,
        },
    )
}

// ─── Codec properties ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn proptest_packet_roundtrip(packet in packet_strategy()) {
        let encoded = packet.encode();
        let decoded = PgmPacket::decode(&encoded).expect("own encoding must decode");
        prop_assert_eq!(decoded, packet);
    }

    #[test]
    fn proptest_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        // Any result is fine; crashing is not.
        let _ = PgmPacket::decode(&bytes);
    }

    #[test]
    fn proptest_truncation_never_panics(packet in packet_strategy(), cut in 0usize..64) {
        let encoded = packet.encode();
        let len = encoded.len().saturating_sub(cut);
        let _ = PgmPacket::decode(&encoded[..len]);
    }

    #[test]
    fn proptest_single_byte_corruption_detected(
        packet in packet_strategy(),
        pos in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut encoded = packet.encode();
        let pos = pos.index(encoded.len());
        encoded[pos] ^= flip;
        // A one-byte change shifts exactly one 16-bit word of the ones'
        // complement sum by less than 0xFFFF, so it can never cancel.
        prop_assert!(PgmPacket::decode(&encoded).is_err());
    }
}

// ─── Serial arithmetic properties ───────────────────────────────────────────

proptest! {
    #[test]
    fn proptest_successor_ordering(a in any::<u32>()) {
        prop_assert!(sn::lt(a, a.wrapping_add(1)));
        prop_assert!(sn::lte(a, a));
        prop_assert!(sn::lt(a, a.wrapping_add((1 << 31) - 1)));
        prop_assert!(sn::gt(a.wrapping_add(1), a));
    }

    #[test]
    fn proptest_antisymmetry_inside_half_range(a in any::<u32>(), d in 1u32..1 << 31) {
        let b = a.wrapping_add(d);
        prop_assert!(sn::lt(a, b));
        prop_assert!(!sn::lt(b, a));
        prop_assert!(sn::gte(b, a));
        prop_assert!(!sn::gte(a, b));
    }

    #[test]
    fn proptest_lt_complements_gte(a in any::<u32>(), b in any::<u32>()) {
        prop_assert_eq!(sn::lt(a, b), !sn::gte(a, b));
        prop_assert_eq!(sn::gt(a, b), !sn::lte(a, b));
    }

    #[test]
    fn proptest_range_membership(trail in any::<u32>(), span in 0u32..4096, off in 0u32..4096) {
        let lead = trail.wrapping_add(span);
        let inside = trail.wrapping_add(off.min(span));
        prop_assert!(sn::in_range(inside, trail, lead));
        prop_assert!(!sn::in_range(lead.wrapping_add(1), trail, lead));
        prop_assert!(!sn::in_range(trail.wrapping_sub(1), trail, lead));
    }
}
