//! Central manager (CM): page directory, write serialization, and
//! primary/backup failover.

mod central;
mod directory;
mod failover;
mod stats;

pub use central::{CentralManager, ManagerConfig, ManagerNode};
pub use directory::{Directory, DirectorySnapshot, Effect, Record};
pub use failover::CmRole;
pub use stats::StatsBoard;
