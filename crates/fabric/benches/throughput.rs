//! Producer emit and drain throughput over a real shared-memory session.

use ada_fabric::record::{EnterEvent, KIND_ENTER};
use ada_fabric::{Fabric, SessionId};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

fn bench_session(tag: u32) -> (Fabric, SessionId) {
    let session = SessionId { host_pid: std::process::id(), session_id: 0xBE_0000 | tag };
    let _ = ada_fabric::cleanup_stale_sessions();
    (Fabric::create(session).expect("bench fabric"), session)
}

/// Single-producer push into one ring, consumer keeping pace inline.
fn ring_push_throughput(c: &mut Criterion) {
    let (fabric, _) = bench_session(1);
    let pool = fabric.pool();
    let ring = pool.ring(pool.pop_free().unwrap());

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_index_frame", |b| {
        let wire = EnterEvent { function_id: 42, timestamp_ns: 1 }.encode();
        b.iter(|| {
            if ring.push_frame(KIND_ENTER, &wire).is_err() {
                ring.consume_frames(usize::MAX, |_, _| {});
                ring.push_frame(KIND_ENTER, &wire).unwrap();
            }
        });
    });
    group.finish();
}

/// Batch drain of a pre-filled ring.
fn ring_drain_throughput(c: &mut Criterion) {
    let (fabric, _) = bench_session(2);
    let pool = fabric.pool();
    let ring = pool.ring(pool.pop_free().unwrap());
    let wire = EnterEvent { function_id: 7, timestamp_ns: 2 }.encode();

    let mut filled = 0u64;
    while ring.push_frame(KIND_ENTER, &wire).is_ok() {
        filled += 1;
    }

    let mut group = c.benchmark_group("drain");
    group.throughput(Throughput::Elements(filled));
    group.bench_function("consume_full_ring", |b| {
        b.iter(|| {
            let n = ring.consume_frames(usize::MAX, |_, _| {}).records;
            assert_eq!(n as u64, filled);
            // Refill for the next iteration.
            ring.recycle();
            for _ in 0..filled {
                ring.push_frame(KIND_ENTER, &wire).unwrap();
            }
        });
    });
    group.finish();
}

/// Contended multi-producer pushes into the shared fallback ring.
fn fallback_contention(c: &mut Criterion) {
    let (fabric, _) = bench_session(3);
    let pool = fabric.pool();
    let fallback = pool.fallback();
    let wire = EnterEvent { function_id: 9, timestamp_ns: 3 }.encode();

    let mut group = c.benchmark_group("fallback");
    group.throughput(Throughput::Elements(1));
    group.bench_function("mirror_push", |b| {
        b.iter(|| {
            if fallback.push_frame(KIND_ENTER, &wire).is_err() {
                fallback.ring().consume_frames(usize::MAX, |_, _| {});
                fallback.push_frame(KIND_ENTER, &wire).unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(benches, ring_push_throughput, ring_drain_throughput, fallback_contention);
criterion_main!(benches);
