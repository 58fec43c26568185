//! Ivy-style distributed shared virtual memory: a central manager arbitrates
//! page ownership and read copy sets among client nodes, with a passive
//! backup manager taking over when the primary goes silent.

#[macro_use]
mod utils;

mod client;
mod manager;
mod message;
mod registry;
mod rpc;

// below are exported as public library interface

pub use crate::utils::{logger_init, DsmError};

pub use crate::message::{
    Message, NodeId, NodePtr, PageId, Permission, RpcReply, RpcRequest,
    StatsReport,
};

pub use crate::rpc::{rpc_call, RpcHandler, RpcServer};

pub use crate::registry::NodeRegistry;

pub use crate::manager::{
    CentralManager, CmRole, Directory, DirectorySnapshot, Effect,
    ManagerConfig, ManagerNode, Record, StatsBoard,
};

pub use crate::client::{
    ClientCache, ClientConfig, ClientNode, LatencyStats, PageCache, Workload,
};
