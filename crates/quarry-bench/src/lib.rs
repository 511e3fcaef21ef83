//! Deterministic workloads for the Quarry benchmarks.
//!
//! - [`request_sizes`]: seeded allocation sizes in a range
//! - [`free_order`]: seeded permutation for out-of-order frees

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::ops::RangeInclusive;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// `count` allocation sizes drawn uniformly from `range`.
pub fn request_sizes(seed: u64, count: usize, range: RangeInclusive<usize>) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count).map(|_| rng.random_range(range.clone())).collect()
}

/// A permutation of `0..count`, used as the order to free allocations in.
pub fn free_order(seed: u64, count: usize) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..count).collect();
    order.shuffle(&mut rng);
    order
}
