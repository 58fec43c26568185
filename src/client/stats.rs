//! Response time bookkeeping of a client's page requests.

use std::collections::HashMap;

use crate::message::{NodeId, PageId, Permission, StatsReport};

use tokio::time::{Duration, Instant};

/// Request start instants keyed by what was asked for, plus totals of
/// completed requests.
#[derive(Debug, Default)]
pub struct LatencyStats {
    pending: HashMap<(PageId, Permission), Instant>,

    reads: u64,
    read_total: Duration,

    writes: u64,
    write_total: Duration,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a request as sent. A repeated request for the same access
    /// keeps the earlier start.
    pub fn start(&mut self, page: PageId, perm: Permission) {
        self.pending.entry((page, perm)).or_insert_with(Instant::now);
    }

    /// Abandons a request that failed.
    pub fn cancel(&mut self, page: PageId, perm: Permission) {
        self.pending.remove(&(page, perm));
    }

    /// Marks a request as served. Grants nobody waited for are not counted.
    /// Returns the elapsed time if one was pending.
    pub fn finish(&mut self, page: PageId, perm: Permission) -> Option<Duration> {
        let elapsed = self.pending.remove(&(page, perm))?.elapsed();
        match perm {
            Permission::Read => {
                self.reads += 1;
                self.read_total += elapsed;
            }
            Permission::Write => {
                self.writes += 1;
                self.write_total += elapsed;
            }
        }
        Some(elapsed)
    }

    /// Number of requests still unanswered.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Summary of completed requests, averages 0 where there were none.
    pub fn report(&self, node: NodeId) -> StatsReport {
        let avg = |total: Duration, cnt: u64| {
            if cnt == 0 {
                0.0
            } else {
                total.as_secs_f64() / cnt as f64
            }
        };
        StatsReport {
            node,
            reads: self.reads,
            writes: self.writes,
            avg_read_secs: avg(self.read_total, self.reads),
            avg_write_secs: avg(self.write_total, self.writes),
        }
    }
}
