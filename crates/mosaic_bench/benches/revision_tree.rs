//! Revision tree benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mosaic_bench::random_keys;
use mosaic_core::RevisionTree;

fn tree_with(keys: &[u64]) -> RevisionTree {
    let tree = RevisionTree::new(6, 3).unwrap();
    tree.insert_batch(keys);
    tree
}

/// Benchmark key inserts.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_insert");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let keys = random_keys(count, 1 << 18);
            b.iter(|| {
                let tree = RevisionTree::new(6, 3).unwrap();
                for key in &keys {
                    tree.insert(black_box(*key));
                }
                black_box(tree.root_hash());
            });
        });
    }
    group.finish();
}

/// Benchmark insert followed by remove of the same keys.
fn bench_insert_remove(c: &mut Criterion) {
    let keys = random_keys(1_000, 1 << 18);
    let tree = RevisionTree::new(6, 3).unwrap();

    c.bench_function("tree_insert_remove_1000", |b| {
        b.iter(|| {
            tree.insert_batch(black_box(&keys));
            tree.remove_batch(black_box(&keys)).unwrap();
        });
    });
}

/// Benchmark diffs between trees that differ in a few keys.
fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_diff");

    for differing in [0usize, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(differing),
            differing,
            |b, &differing| {
                let keys = random_keys(10_000, 1 << 18);
                let mine = tree_with(&keys);
                let theirs = tree_with(&keys[differing..]);
                b.iter(|| black_box(mine.diff(&theirs).unwrap()));
            },
        );
    }
    group.finish();
}

/// Benchmark range growth for keys far outside the covered range.
fn bench_grow(c: &mut Criterion) {
    let keys = random_keys(1_000, 1 << 18);
    c.bench_function("tree_grow_1000", |b| {
        b.iter(|| {
            let tree = tree_with(&keys);
            tree.grow(black_box(1 << 40));
            black_box(tree.range());
        });
    });
}

/// Benchmark serialization and restore.
fn bench_serialize(c: &mut Criterion) {
    let tree = tree_with(&random_keys(10_000, 1 << 18));
    c.bench_function("tree_to_bytes", |b| b.iter(|| black_box(tree.to_bytes().unwrap())));

    let bytes = tree.to_bytes().unwrap();
    c.bench_function("tree_from_bytes", |b| {
        b.iter(|| black_box(RevisionTree::from_bytes(black_box(&bytes)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_insert,
    bench_insert_remove,
    bench_diff,
    bench_grow,
    bench_serialize,
);

criterion_main!(benches);
