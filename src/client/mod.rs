//! Client node: page cache state machine, workload, and latency stats.

mod cache;
mod node;
mod stats;
mod workload;

pub use cache::PageCache;
pub use node::{ClientCache, ClientConfig, ClientNode};
pub use stats::LatencyStats;
pub use workload::Workload;
