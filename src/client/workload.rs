//! Random page access pattern driving a client.

use crate::message::{PageId, Permission};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform random page picks, each a read with probability
/// `read_percentage`%.
#[derive(Debug)]
pub struct Workload {
    rng: StdRng,
    num_pages: PageId,
    read_percentage: u8,
}

impl Workload {
    pub fn new(num_pages: PageId, read_percentage: u8) -> Self {
        Self::with_rng(StdRng::from_entropy(), num_pages, read_percentage)
    }

    /// Deterministic workload for reproducible runs.
    pub fn with_seed(seed: u64, num_pages: PageId, read_percentage: u8) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), num_pages, read_percentage)
    }

    fn with_rng(rng: StdRng, num_pages: PageId, read_percentage: u8) -> Self {
        debug_assert!(num_pages > 0);
        debug_assert!(read_percentage <= 100);
        Workload {
            rng,
            num_pages,
            read_percentage,
        }
    }

    /// Next access to make.
    pub fn next_op(&mut self) -> (PageId, Permission) {
        let page = self.rng.gen_range(0..self.num_pages);
        let perm = if self.rng.gen_range(0..100) < self.read_percentage {
            Permission::Read
        } else {
            Permission::Write
        };
        (page, perm)
    }
}
