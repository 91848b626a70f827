//! # Window hot-path benchmarks
//!
//! The per-packet costs that bound throughput: transmit push + peek,
//! receive insert + drain, and the full encode → decode → window loop.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pgm_transport::pool::SkBuff;
use pgm_transport::rxw::{Msgv, ReceiveWindow, RxwConfig};
use pgm_transport::tsi::{Gsi, Tsi};
use pgm_transport::txw::{TransmitWindow, TxwConfig};
use pgm_transport::wire::{DataPacket, PacketBody, PgmPacket};

const PAYLOAD: usize = 1200;

fn session() -> Tsi {
    Tsi::new(Gsi::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]), 9000)
}

fn txw() -> TransmitWindow {
    let config = TxwConfig {
        sqns: 4096,
        preallocate: 4096,
        initial_sequence: Some(u32::MAX),
        ..TxwConfig::default()
    };
    TransmitWindow::new(&config, session()).unwrap()
}

fn rxw() -> ReceiveWindow {
    let config = RxwConfig {
        sqns: 4096,
        ..RxwConfig::default()
    };
    ReceiveWindow::new(config, session()).unwrap()
}

fn bench_txw_push(c: &mut Criterion) {
    let payload = vec![0xABu8; PAYLOAD];
    let mut group = c.benchmark_group("txw");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("push_copy", |b| {
        let mut window = txw();
        b.iter(|| {
            let sqn = window.push_copy(black_box(&payload), None, 0).unwrap();
            black_box(sqn);
        });
    });

    group.bench_function("push_then_peek", |b| {
        let mut window = txw();
        b.iter(|| {
            let sqn = window.push_copy(black_box(&payload), None, 0).unwrap();
            black_box(window.peek(sqn).unwrap().len());
        });
    });
    group.finish();
}

fn bench_rxw_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("rxw");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("add_then_read", |b| {
        let mut window = rxw();
        let mut sqn = 0u32;
        let mut msgv: Vec<Msgv> = Vec::with_capacity(8);
        let payload = Bytes::from(vec![0xCDu8; PAYLOAD]);
        b.iter(|| {
            window.add(
                SkBuff {
                    tsi: session(),
                    sequence: sqn,
                    tstamp: 0,
                    fragment: None,
                    payload: payload.clone(),
                },
                0,
            );
            sqn = sqn.wrapping_add(1);
            msgv.clear();
            black_box(window.read(&mut msgv, 8));
        });
    });
    group.finish();
}

fn bench_wire_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    group.bench_function("encode_decode_deliver", |b| {
        let mut tx = txw();
        let mut rx = rxw();
        let payload = vec![0xEFu8; PAYLOAD];
        let mut msgv: Vec<Msgv> = Vec::with_capacity(8);
        b.iter(|| {
            let sequence = tx.push_copy(&payload, None, 0).unwrap();
            let packet = PgmPacket {
                sport: 9000,
                dport: 7500,
                gsi: Gsi::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
                body: PacketBody::OriginalData(DataPacket {
                    sequence,
                    trail: tx.trail(),
                    fragment: None,
                    tsdu: tx.peek(sequence).unwrap().payload.clone(),
                }),
            };
            let wire = packet.encode();
            let decoded = PgmPacket::decode(&wire).unwrap();
            let tsi = decoded.tsi();
            if let PacketBody::OriginalData(d) = decoded.body {
                rx.add(
                    SkBuff {
                        tsi,
                        sequence: d.sequence,
                        tstamp: 0,
                        fragment: d.fragment,
                        payload: d.tsdu,
                    },
                    0,
                );
            }
            msgv.clear();
            black_box(rx.read(&mut msgv, 8));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_txw_push, bench_rxw_insert, bench_wire_loop);
criterion_main!(benches);
