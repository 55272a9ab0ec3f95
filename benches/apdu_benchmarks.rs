// ABOUTME: Benchmark suite for APDU encode/decode throughput
// ABOUTME: Covers each frame kind, plus a realistic mixed workload

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use iec104_apci::apdu::{self, Apdu, UFunction};

fn sample_i_frame(payload_len: usize) -> Apdu {
    Apdu::I {
        send_seq: 12,
        recv_seq: 34,
        payload: Bytes::from(vec![0xAB; payload_len]),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    group.bench_function("u_frame", |b| {
        let apdu = Apdu::U(UFunction::StartDtAct);
        b.iter(|| apdu::encode(black_box(&apdu)));
    });

    group.bench_function("s_frame", |b| {
        let apdu = Apdu::S { recv_seq: 100 };
        b.iter(|| apdu::encode(black_box(&apdu)));
    });

    for payload_len in [0usize, 16, 249] {
        group.bench_with_input(
            BenchmarkId::new("i_frame", payload_len),
            &payload_len,
            |b, &len| {
                let apdu = sample_i_frame(len);
                b.iter(|| apdu::encode(black_box(&apdu)));
            },
        );
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    group.bench_function("u_frame", |b| {
        let frame = apdu::encode(&Apdu::U(UFunction::TestFrAct));
        b.iter(|| apdu::decode(black_box(&frame)).unwrap());
    });

    for payload_len in [0usize, 16, 249] {
        group.bench_with_input(
            BenchmarkId::new("i_frame", payload_len),
            &payload_len,
            |b, &len| {
                let frame = apdu::encode(&sample_i_frame(len));
                b.iter(|| apdu::decode(black_box(&frame)).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
