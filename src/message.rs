//! Wire-level data types shared by managers and clients.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use crate::manager::DirectorySnapshot;
use crate::utils::DsmError;

use serde::{Deserialize, Serialize};

/// Page identifier, drawn from a small universe known to all nodes.
pub type PageId = u32;

/// Client node identity.
pub type NodeId = u32;

/// Pointer to a client node: its identity plus the address to dial it at.
/// Two pointers are equal iff their identities match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodePtr {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodePtr {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        NodePtr { id, addr }
    }
}

impl PartialEq for NodePtr {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodePtr {}

impl Hash for NodePtr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodePtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Access permission carried with a page.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    /// Whether holding `self` is enough to serve an access of kind `wanted`.
    /// Write satisfies everything; Read only satisfies reads.
    pub fn satisfies(self, wanted: Permission) -> bool {
        self == Permission::Write || wanted == Permission::Read
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Permission::Read => write!(f, "READ"),
            Permission::Write => write!(f, "WRITE"),
        }
    }
}

/// Coherence protocol message, delivered through a node's `ReceiveRequest`
/// entry point. Each kind carries exactly the fields it needs.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Liveness check.
    Ping,

    /// Client -> CM: read access wanted.
    Read { from: NodePtr, page: PageId },

    /// Client -> CM: write access wanted.
    Write { from: NodePtr, page: PageId },

    /// CM -> owner: hand a read copy to `requester` and demote yourself.
    ReadForward { page: PageId, requester: NodePtr },

    /// CM -> owner: hand the writable copy to `requester` and drop yours.
    WriteForward { page: PageId, requester: NodePtr },

    /// Owner or CM -> granted client: the page, at the given permission.
    ReceivePage { page: PageId, perm: Permission },

    /// CM -> copy holder: drop your cached copy.
    InvalidateCache { page: PageId },

    /// Client -> CM: a read grant arrived.
    ReadConfirmation { from: NodePtr, page: PageId },

    /// Client -> CM: a write grant arrived; I am the exclusive owner now.
    WriteConfirmation { from: NodePtr, page: PageId },

    /// Client -> CM: my cached copy was dropped.
    InvalidateConfirmation { from: NodePtr, page: PageId },
}

impl Message {
    /// Name of the message kind, as used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping => "PING",
            Message::Read { .. } => "READ",
            Message::Write { .. } => "WRITE",
            Message::ReadForward { .. } => "READ_FORWARD",
            Message::WriteForward { .. } => "WRITE_FORWARD",
            Message::ReceivePage { .. } => "RECEIVE_PAGE",
            Message::InvalidateCache { .. } => "INVALIDATE_CACHE",
            Message::ReadConfirmation { .. } => "READ_CONFIRMATION",
            Message::WriteConfirmation { .. } => "WRITE_CONFIRMATION",
            Message::InvalidateConfirmation { .. } => {
                "INVALIDATE_CONFIRMATION"
            }
        }
    }

    /// Page the message is about, if any.
    pub fn page(&self) -> Option<PageId> {
        match *self {
            Message::Ping => None,
            Message::Read { page, .. }
            | Message::Write { page, .. }
            | Message::ReadForward { page, .. }
            | Message::WriteForward { page, .. }
            | Message::ReceivePage { page, .. }
            | Message::InvalidateCache { page }
            | Message::ReadConfirmation { page, .. }
            | Message::WriteConfirmation { page, .. }
            | Message::InvalidateConfirmation { page, .. } => Some(page),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.page() {
            Some(page) => write!(f, "{}(page {})", self.kind(), page),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Per-node latency summary a client reports once its workload is done.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub node: NodeId,
    pub reads: u64,
    pub writes: u64,
    pub avg_read_secs: f64,
    pub avg_write_secs: f64,
}

/// Remote call, naming the method invoked on the target node.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Liveness check outside of the coherence protocol.
    Ping,

    /// `ReceiveRequest` entry point of a manager or client.
    Protocol(Message),

    /// Failover state push into a manager.
    Backup(DirectorySnapshot),

    /// Makes the manager at `addr` the acting manager.
    DeclareCm { addr: SocketAddr },

    /// Retargets a client's future manager calls to `addr`.
    UpdateServerAddr { addr: SocketAddr },

    /// Tells a client to start its workload.
    StartWorkload,

    /// Client latency summary for the manager.
    ReportStats(StatsReport),
}

/// Reply to an `RpcRequest`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Ack,
    Failed(DsmError),
}

#[cfg(test)]
mod message_tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn node_ptr_identity() -> Result<(), DsmError> {
        let a = NodePtr::new(3, "127.0.0.1:8005".parse()?);
        let b = NodePtr::new(3, "127.0.0.1:9999".parse()?);
        let c = NodePtr::new(5, "127.0.0.1:8005".parse()?);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<NodePtr> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        Ok(())
    }

    #[test]
    fn permission_satisfies() {
        assert!(Permission::Read.satisfies(Permission::Read));
        assert!(!Permission::Read.satisfies(Permission::Write));
        assert!(Permission::Write.satisfies(Permission::Read));
        assert!(Permission::Write.satisfies(Permission::Write));
    }

    #[test]
    fn message_kind_and_page() -> Result<(), DsmError> {
        let from = NodePtr::new(7, "127.0.0.1:8009".parse()?);
        let msg = Message::WriteConfirmation { from, page: 2 };
        assert_eq!(msg.kind(), "WRITE_CONFIRMATION");
        assert_eq!(msg.page(), Some(2));
        assert_eq!(format!("{}", msg), "WRITE_CONFIRMATION(page 2)");
        assert_eq!(Message::Ping.page(), None);
        assert_eq!(format!("{}", Message::Ping), "PING");
        Ok(())
    }
}
