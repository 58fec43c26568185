//! Aggregation of the latency reports clients send after their workload.

use std::collections::BTreeMap;

use crate::message::{NodeId, StatsReport};

use statistical::mean;

/// Latest latency report of every client that sent one.
#[derive(Debug, Default)]
pub struct StatsBoard {
    reports: BTreeMap<NodeId, StatsReport>,
}

impl StatsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saves a report, replacing any earlier one from the same node.
    pub fn submit(&mut self, report: StatsReport) {
        self.reports.insert(report.node, report);
    }

    /// Number of nodes that reported.
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Mean (read, write) response time in seconds across reporting nodes,
    /// counting only nodes that issued at least one such request. `None`
    /// where no node did.
    pub fn summarize(&self) -> (Option<f64>, Option<f64>) {
        let reads: Vec<f64> = self
            .reports
            .values()
            .filter(|r| r.reads > 0)
            .map(|r| r.avg_read_secs)
            .collect();
        let writes: Vec<f64> = self
            .reports
            .values()
            .filter(|r| r.writes > 0)
            .map(|r| r.avg_write_secs)
            .collect();

        let avg = |v: &[f64]| if v.is_empty() { None } else { Some(mean(v)) };
        (avg(&reads), avg(&writes))
    }

    /// Logs the cross-node summary as `me`.
    pub fn log_summary(&self, me: &str) {
        let (read_avg, write_avg) = self.summarize();
        let show = |avg: Option<f64>| {
            avg.map_or("n/a".into(), |secs| format!("{:.6}s", secs))
        };
        pf_info!(me;
            "avg response over {} nodes: read {}, write {}",
            self.len(),
            show(read_avg),
            show(write_avg)
        );
    }
}
