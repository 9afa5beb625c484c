//! In-memory engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mosaic_bench::random_data;
use mosaic_storage::{InMemoryEngine, KeyRange, KeyValueEngine, WriteBatch};

fn key(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

fn seeded(count: u64, size: usize) -> InMemoryEngine {
    let engine = InMemoryEngine::new();
    let value = random_data(size);
    let mut batch = WriteBatch::new();
    for n in 0..count {
        batch.put(key(n), value.clone());
    }
    engine.commit(&batch).unwrap();
    engine
}

/// Benchmark batch commits.
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_commit");

    for entries in [1u64, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*entries));
        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            let engine = InMemoryEngine::new();
            let value = random_data(256);
            let mut next = 0u64;

            b.iter(|| {
                let mut batch = WriteBatch::new();
                for _ in 0..entries {
                    next += 1;
                    batch.put(key(next), value.clone());
                }
                black_box(engine.commit(&batch).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark snapshot point reads.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_get");

    for size in [64, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let engine = seeded(1_000, size);
            let snapshot = engine.snapshot();
            let mut n = 0u64;

            b.iter(|| {
                n = (n + 1) % 1_000;
                black_box(engine.get(&snapshot, &key(n)).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark a full range scan.
fn bench_scan(c: &mut Criterion) {
    let engine = seeded(10_000, 64);
    c.bench_function("engine_scan_10000", |b| {
        b.iter(|| {
            let snapshot = engine.snapshot();
            let mut iter = engine
                .iterator(&snapshot, KeyRange::new(key(0), key(u64::MAX)))
                .unwrap();
            let mut seen = 0usize;
            while iter.next_entry().unwrap().is_some() {
                seen += 1;
            }
            black_box(seen);
        });
    });
}

criterion_group!(benches, bench_commit, bench_get, bench_scan);

criterion_main!(benches);
