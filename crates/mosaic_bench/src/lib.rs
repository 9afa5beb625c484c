//! Benchmark utilities.

use mosaic_core::{CollectionId, Config, Database};
use rand::Rng;

/// Collection used by the database benchmarks.
pub const BENCH: CollectionId = CollectionId(1);

/// Generate random document data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct random revision keys below `max`.
pub fn random_keys(count: usize, max: u64) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut keys = std::collections::BTreeSet::new();
    while keys.len() < count {
        keys.insert(rng.gen_range(0..max));
    }
    keys.into_iter().collect()
}

/// Opens an in-memory database with [`BENCH`] registered.
pub fn bench_database(config: Config) -> Database {
    let db = Database::open_in_memory_with_config(config);
    db.register_collection(BENCH, "bench")
        .expect("fresh database has no bench collection");
    db
}
