//! Test and benchmark utilities.
//!
//! This module is only available when the `testutil` feature is enabled.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::codec::{Tuple, TupleCodec};
use crate::conf::SpillConfig;
use crate::container::{SpillableBag, SpillableColumn};
use crate::harness::stress_tuple;

pub const TEST_RNG_SEED: u64 = 42;
pub const RECORD_FIELDS: usize = 5;

/// Spill config rooted in a fresh temp dir. Keep the `TempDir` alive for as
/// long as the container is in use.
pub fn temp_spill_config(slab_capacity: usize) -> (SpillConfig, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = SpillConfig::in_dir(dir.path()).with_slab_capacity(slab_capacity);
    (config, dir)
}

pub fn temp_column(slab_capacity: usize) -> (SpillableColumn<i64>, TempDir) {
    let (config, dir) = temp_spill_config(slab_capacity);
    (SpillableColumn::new(config).unwrap(), dir)
}

pub fn temp_bag(slab_capacity: usize) -> (SpillableBag<TupleCodec>, TempDir) {
    let (config, dir) = temp_spill_config(slab_capacity);
    (SpillableBag::new(TupleCodec, config).unwrap(), dir)
}

/// Five-field record keyed by `i`.
pub fn record(i: u64) -> Tuple {
    stress_tuple(i, RECORD_FIELDS)
}

/// Key of a record built by `record`.
pub fn record_key(tuple: &Tuple) -> u64 {
    tuple[0].as_i64().unwrap() as u64
}

/// Sorted, deduplicated positions in `0..len` at which a test should call
/// `spill()`. Deterministic for a given seed.
pub fn spill_points(seed: u64, len: u64, count: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points: Vec<u64> = (0..count).map(|_| rng.gen_range(0..len.max(1))).collect();
    points.sort_unstable();
    points.dedup();
    points
}

/// Number of spill files left in `dir`.
pub fn spill_files(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path()).unwrap().count()
}
