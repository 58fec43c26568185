//! Central manager: serves coherence requests against the page directory and
//! carries out the sends each directory transition calls for.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::manager::directory::{Directory, Effect, Record};
use crate::manager::failover::CmRole;
use crate::manager::stats::StatsBoard;
use crate::message::{Message, NodePtr, PageId, Permission, RpcRequest};
use crate::registry::NodeRegistry;
use crate::rpc::{rpc_call, RpcHandler, RpcServer};
use crate::utils::DsmError;

use async_trait::async_trait;

use futures::future::join_all;

use serde::Deserialize;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Primary -> backup snapshot push interval in millisecs.
    pub sync_interval_ms: u64,

    /// Backup -> primary health check interval in millisecs.
    pub health_interval_ms: u64,

    /// Consecutive failed health checks before the backup takes over.
    pub fail_threshold: u32,

    /// Length of a simulated reboot in seconds.
    pub reboot_secs: u64,

    /// Timeout of every outgoing call in millisecs.
    pub rpc_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            sync_interval_ms: 1000,
            health_interval_ms: 1000,
            fail_threshold: 2,
            reboot_secs: 10,
            rpc_timeout_ms: 5000,
        }
    }
}

/// Request handling side of a manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CentralManager {
    /// Logging identity, "cm-primary" or "cm-backup".
    pub(crate) me: String,

    /// Address clients and the peer manager reach me at.
    pub(crate) my_addr: SocketAddr,

    /// Address of the other manager of the pair.
    pub(crate) peer_addr: SocketAddr,

    pub(crate) config: ManagerConfig,

    /// Page directory; every protocol step goes through this lock.
    pub(crate) directory: Arc<Mutex<Directory>>,

    /// Current failover role.
    pub(crate) role: Arc<Mutex<CmRole>>,

    /// Latency reports of clients.
    stats: Arc<Mutex<StatsBoard>>,

    /// Where clients are listed.
    pub(crate) registry: NodeRegistry,
}

impl CentralManager {
    pub fn new(
        role: CmRole,
        my_addr: SocketAddr,
        peer_addr: SocketAddr,
        registry: NodeRegistry,
        config: ManagerConfig,
    ) -> Self {
        let me = match role {
            CmRole::Primary => "cm-primary",
            _ => "cm-backup",
        };
        CentralManager {
            me: me.into(),
            my_addr,
            peer_addr,
            config,
            directory: Arc::new(Mutex::new(Directory::new(me))),
            role: Arc::new(Mutex::new(role)),
            stats: Arc::new(Mutex::new(StatsBoard::new())),
            registry,
        }
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    /// Handles one coherence protocol message.
    pub async fn receive_request(&self, msg: Message) -> Result<(), DsmError> {
        pf_debug!(self.me; "recv {}", msg);
        let effects = {
            let mut directory = self.directory.lock().await;
            match msg {
                Message::Ping => vec![],
                Message::Read { from, page } => match directory.read(page, from) {
                    Ok(effects) => effects,
                    Err(e) => {
                        pf_warn!(self.me; "READ page {} from {} failed: {}",
                                 page, from, e);
                        return Err(e);
                    }
                },
                Message::Write { from, page } => directory.write(page, from),
                Message::WriteConfirmation { from, page } => {
                    directory.write_confirmed(page, from)
                }
                Message::ReadConfirmation { from, page } => {
                    directory.read_confirmed(page, from.id)
                }
                Message::InvalidateConfirmation { from, page } => {
                    directory.invalidate_confirmed(page, from.id)
                }
                _ => {
                    return logged_err!(self.me; "unexpected {} at manager", msg)
                }
            }
        };

        self.dispatch(effects);
        Ok(())
    }

    /// Carries out effects in the background. Whatever follows from a
    /// failed send is dispatched in turn.
    pub(crate) fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            let cm = self.clone();
            tokio::spawn(async move {
                let more = cm.perform(effect).await;
                cm.dispatch(more);
            });
        }
    }

    async fn send(&self, to: SocketAddr, msg: Message) -> Result<(), DsmError> {
        pf_trace!(self.me; "send {} -> {}", msg, to);
        rpc_call(to, &RpcRequest::Protocol(msg), self.rpc_timeout()).await
    }

    /// Performs one send. A peer that cannot be reached is treated as having
    /// confirmed, so nothing waits on it forever.
    async fn perform(&self, effect: Effect) -> Vec<Effect> {
        match effect {
            Effect::ReadForward {
                page,
                owner,
                requester,
            } => {
                let msg = Message::ReadForward { page, requester };
                if let Err(e) = self.send(owner.addr, msg).await {
                    pf_warn!(self.me;
                        "READ_FORWARD page {} to owner {} failed: {}",
                        page,
                        owner,
                        e
                    );
                    return self.directory.lock().await.read_failed(page, requester);
                }
            }

            Effect::Invalidate { page, holder } => {
                let msg = Message::InvalidateCache { page };
                if let Err(e) = self.send(holder.addr, msg).await {
                    pf_warn!(self.me;
                        "INVALIDATE_CACHE page {} to {} failed: {}",
                        page,
                        holder,
                        e
                    );
                    return self
                        .directory
                        .lock()
                        .await
                        .invalidate_confirmed(page, holder.id);
                }
            }

            Effect::WriteForward {
                page,
                owner,
                requester,
            } => {
                let msg = Message::WriteForward { page, requester };
                if let Err(e) = self.send(owner.addr, msg).await {
                    pf_error!(self.me;
                        "WRITE_FORWARD page {} to owner {} failed: {}",
                        page,
                        owner,
                        e
                    );
                }
            }

            Effect::GrantWrite { page, requester } => {
                let msg = Message::ReceivePage {
                    page,
                    perm: Permission::Write,
                };
                if let Err(e) = self.send(requester.addr, msg).await {
                    pf_error!(self.me;
                        "RECEIVE_PAGE page {} to {} failed: {}",
                        page,
                        requester,
                        e
                    );
                }
            }
        }
        vec![]
    }

    /// Calls every registered client with `req` concurrently. Returns the
    /// number of clients that acked.
    pub(crate) async fn broadcast(&self, req: RpcRequest) -> usize {
        let clients = match self.registry.clients() {
            Ok(clients) => clients,
            Err(e) => {
                pf_error!(self.me; "error reading registry: {}", e);
                return 0;
            }
        };

        let timeout = self.rpc_timeout();
        let calls = clients.iter().map(|c| rpc_call(c.addr, &req, timeout));
        let results = join_all(calls).await;

        let mut acked = 0;
        for (client, result) in clients.iter().zip(results) {
            match result {
                Ok(()) => acked += 1,
                Err(e) => {
                    pf_warn!(self.me; "{:?} to {} failed: {}", req, client, e)
                }
            }
        }
        acked
    }

    /// Tells every registered client to start its workload.
    pub async fn start_workloads(&self) -> usize {
        let acked = self.broadcast(RpcRequest::StartWorkload).await;
        pf_info!(self.me; "started workload on {} clients", acked);
        acked
    }
}

#[async_trait]
impl RpcHandler for CentralManager {
    async fn handle(&self, req: RpcRequest) -> Result<(), DsmError> {
        match req {
            RpcRequest::Ping => Ok(()),
            RpcRequest::Protocol(msg) => self.receive_request(msg).await,
            RpcRequest::Backup(snapshot) => {
                self.handle_backup(snapshot).await;
                Ok(())
            }
            RpcRequest::DeclareCm { addr } => self.declare_cm(addr).await,
            RpcRequest::ReportStats(report) => {
                pf_info!(self.me;
                    "node {} stats: {} reads avg {:.6}s, {} writes avg {:.6}s",
                    report.node,
                    report.reads,
                    report.avg_read_secs,
                    report.writes,
                    report.avg_write_secs
                );
                let mut stats = self.stats.lock().await;
                stats.submit(report);
                stats.log_summary(&self.me);
                Ok(())
            }
            req => {
                logged_err!(self.me; "unexpected request {:?} at manager", req)
            }
        }
    }
}

/// A running manager: request handling, its listener, and its failover loop.
pub struct ManagerNode {
    cm: CentralManager,

    server: RpcServer,

    /// Sender side of the termination channel of the failover loop.
    tx_term: watch::Sender<bool>,

    /// Join handle of the failover loop.
    failover_handle: JoinHandle<()>,
}

impl ManagerNode {
    /// Starts a manager listening on its own address, `primary` if `role`
    /// is `Primary` and `backup` if it is `Standby`. `config_str` is an
    /// optional TOML string overriding `ManagerConfig` defaults.
    pub async fn new_and_setup(
        role: CmRole,
        primary: SocketAddr,
        backup: SocketAddr,
        registry: NodeRegistry,
        config_str: Option<&str>,
    ) -> Result<Self, DsmError> {
        let config = parsed_config!(config_str => ManagerConfig;
                                    sync_interval_ms, health_interval_ms,
                                    fail_threshold, reboot_secs,
                                    rpc_timeout_ms)?;

        let (my_addr, peer_addr) = match role {
            CmRole::Primary => (primary, backup),
            CmRole::Standby => (backup, primary),
            CmRole::Promoted => {
                return logged_err!("cm"; "manager cannot start as {:?}", role);
            }
        };
        if config.fail_threshold == 0 {
            return logged_err!("cm";
                "invalid config.fail_threshold '{}'",
                config.fail_threshold
            );
        }

        let cm = CentralManager::new(role, my_addr, peer_addr, registry, config);
        let server =
            RpcServer::new_and_setup(&cm.me, my_addr, Arc::new(cm.clone()))
                .await?;

        let (tx_term, rx_term) = watch::channel(false);
        let failover_handle = cm.spawn_failover(server.reboot_gate(), rx_term);

        pf_info!(cm.me; "manager up on {} as {:?}", my_addr, role);
        Ok(ManagerNode {
            cm,
            server,
            tx_term,
            failover_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Logging identity of this manager.
    pub fn name(&self) -> &str {
        &self.cm.me
    }

    pub async fn role(&self) -> CmRole {
        *self.cm.role.lock().await
    }

    /// Current records, for inspection.
    pub async fn records(&self) -> BTreeMap<PageId, Record> {
        self.cm.directory.lock().await.records()
    }

    /// Current non-empty write queues, for inspection.
    pub async fn write_queues(&self) -> BTreeMap<PageId, Vec<NodePtr>> {
        self.cm.directory.lock().await.write_queues()
    }

    pub async fn start_workloads(&self) -> usize {
        self.cm.start_workloads().await
    }

    /// Simulates an outage of `secs` seconds: refuses connections and pauses
    /// the failover loop, keeping all state.
    pub async fn reboot(&self, secs: u64) {
        pf_warn!(self.cm.me; "rebooting for {} secs", secs);
        self.server.set_rebooting(true);
        time::sleep(Duration::from_secs(secs)).await;
        self.server.set_rebooting(false);
        pf_info!(self.cm.me; "back from reboot");
    }

    /// Same as `reboot()` with the configured length.
    pub async fn reboot_default(&self) {
        self.reboot(self.cm.config.reboot_secs).await;
    }

    pub fn is_rebooting(&self) -> bool {
        self.server.is_rebooting()
    }

    /// Stops the failover loop. The listener goes away on drop.
    pub async fn shutdown(self) {
        let _ = self.tx_term.send(true);
        if let Err(e) = self.failover_handle.await {
            pf_error!(self.cm.me; "error joining failover loop: {}", e);
        }
    }
}
