//! Primary/backup failover of the central manager. The primary periodically
//! pushes its directory to the backup; the backup pings the primary and
//! takes over once the primary has been unreachable for long enough, then
//! hands authority back when the primary returns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::manager::{CentralManager, DirectorySnapshot};
use crate::message::RpcRequest;
use crate::rpc::rpc_call;
use crate::utils::DsmError;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Failover role of a manager.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CmRole {
    /// The configured primary. Acting whenever it is reachable.
    Primary,

    /// Backup mirroring the primary's pushes.
    Standby,

    /// Backup acting for an unreachable primary.
    Promoted,
}

impl CmRole {
    /// Whether clients are meant to be talking to this manager.
    pub fn is_acting(self) -> bool {
        self != CmRole::Standby
    }
}

// CentralManager failover logic
impl CentralManager {
    /// Installs a snapshot pushed by the peer. Ignored while promoted, as
    /// the pushing primary's state is stale then.
    pub(crate) async fn handle_backup(&self, snapshot: DirectorySnapshot) {
        if *self.role.lock().await == CmRole::Promoted {
            pf_debug!(self.me; "ignored snapshot push while promoted");
            return;
        }

        pf_trace!(self.me;
            "restoring snapshot of {} records {} queues",
            snapshot.records.len(),
            snapshot.queues.len()
        );
        self.directory.lock().await.restore(snapshot);
    }

    /// Makes this manager the acting one: restarts every pending write and
    /// points all registered clients at `addr`.
    pub(crate) async fn declare_cm(
        &self,
        addr: SocketAddr,
    ) -> Result<(), DsmError> {
        if addr != self.my_addr {
            return logged_err!(self.me;
                "declared manager {} is not me ({})",
                addr,
                self.my_addr
            );
        }

        {
            let mut role = self.role.lock().await;
            if *role == CmRole::Standby {
                *role = CmRole::Promoted;
            }
            pf_warn!(self.me; "now acting manager as {:?}", *role);
        }

        let effects = self.directory.lock().await.restart_heads();
        self.dispatch(effects);

        // caller is not kept waiting on the clients
        let cm = self.clone();
        tokio::spawn(async move {
            let acked = cm.broadcast(RpcRequest::UpdateServerAddr { addr }).await;
            pf_info!(cm.me; "told {} clients manager is at {}", acked, addr);
        });
        Ok(())
    }

    /// Promoted backup -> standby: installs own state on the returned
    /// primary and declares it acting.
    async fn hand_back(&self) -> Result<(), DsmError> {
        let timeout = self.rpc_timeout();
        let snapshot = self.directory.lock().await.snapshot();
        rpc_call(self.peer_addr, &RpcRequest::Backup(snapshot), timeout).await?;
        rpc_call(
            self.peer_addr,
            &RpcRequest::DeclareCm {
                addr: self.peer_addr,
            },
            timeout,
        )
        .await?;

        *self.role.lock().await = CmRole::Standby;
        pf_warn!(self.me; "handed authority back to primary {}",
                 self.peer_addr);
        Ok(())
    }

    /// Spawns the failover loop matching this manager's role: snapshot
    /// pushes on the primary, health checks on the backup. The loop idles
    /// while `rebooting` is set and exits on `rx_term`.
    pub(crate) fn spawn_failover(
        &self,
        rebooting: Arc<AtomicBool>,
        rx_term: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cm = self.clone();
        tokio::spawn(async move {
            let is_primary = *cm.role.lock().await == CmRole::Primary;
            let health = HealthTracker::new(cm.config.fail_threshold);
            let task = FailoverTask {
                cm,
                rebooting,
                rx_term,
                health,
            };
            if is_primary {
                task.run_sync_loop().await;
            } else {
                task.run_health_loop().await;
            }
        })
    }
}

/// What the backup does after one health check.
#[derive(Debug, PartialEq, Eq)]
enum HealthAction {
    Idle,
    TakeOver,
    HandBack,
}

/// Consecutive failed health checks of the backup against the primary.
#[derive(Debug)]
struct HealthTracker {
    failures: u32,
    threshold: u32,
}

impl HealthTracker {
    fn new(threshold: u32) -> Self {
        HealthTracker {
            failures: 0,
            threshold,
        }
    }

    /// Folds in the outcome of one ping made while in `role`. A standby
    /// takes over on the `threshold`-th failure in a row; any answer resets
    /// the count. A promoted backup hands back as soon as the primary
    /// answers.
    fn on_ping(&mut self, role: CmRole, alive: bool) -> HealthAction {
        match (role, alive) {
            (CmRole::Standby, true) => {
                self.failures = 0;
                HealthAction::Idle
            }
            (CmRole::Standby, false) => {
                self.failures += 1;
                if self.failures >= self.threshold {
                    self.failures = 0;
                    HealthAction::TakeOver
                } else {
                    HealthAction::Idle
                }
            }
            (CmRole::Promoted, true) => HealthAction::HandBack,
            (CmRole::Promoted, false) | (CmRole::Primary, _) => {
                HealthAction::Idle
            }
        }
    }
}

/// Periodic failover loop state.
struct FailoverTask {
    cm: CentralManager,

    /// Simulated outage gate shared with the listener.
    rebooting: Arc<AtomicBool>,

    rx_term: watch::Receiver<bool>,

    health: HealthTracker,
}

impl FailoverTask {
    /// Waits for the next tick. Returns false upon termination.
    async fn tick(&mut self, interval: &mut time::Interval) -> bool {
        tokio::select! {
            _ = interval.tick() => true,
            _ = self.rx_term.changed() => false,
        }
    }

    fn is_rebooting(&self) -> bool {
        self.rebooting.load(Ordering::SeqCst)
    }

    /// Primary side: pushes the full directory to the backup every
    /// `sync_interval_ms`.
    async fn run_sync_loop(mut self) {
        let mut interval = time::interval(Duration::from_millis(
            self.cm.config.sync_interval_ms,
        ));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pf_debug!(self.cm.me; "snapshot push loop towards {} started",
                  self.cm.peer_addr);

        while self.tick(&mut interval).await {
            if self.is_rebooting() {
                continue;
            }

            let snapshot = self.cm.directory.lock().await.snapshot();
            if let Err(e) = rpc_call(
                self.cm.peer_addr,
                &RpcRequest::Backup(snapshot),
                self.cm.rpc_timeout(),
            )
            .await
            {
                pf_debug!(self.cm.me; "snapshot push failed: {}", e);
            }
        }
    }

    /// Backup side: pings the primary every `health_interval_ms`, takes
    /// over after `fail_threshold` consecutive failures, and hands back once
    /// the primary answers again.
    async fn run_health_loop(mut self) {
        let mut interval = time::interval(Duration::from_millis(
            self.cm.config.health_interval_ms,
        ));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pf_debug!(self.cm.me; "health check loop towards {} started",
                  self.cm.peer_addr);

        while self.tick(&mut interval).await {
            if self.is_rebooting() {
                continue;
            }

            let alive = rpc_call(
                self.cm.peer_addr,
                &RpcRequest::Ping,
                self.cm.rpc_timeout(),
            )
            .await
            .is_ok();
            let role = *self.cm.role.lock().await;

            match self.health.on_ping(role, alive) {
                HealthAction::Idle => {
                    if role == CmRole::Standby && !alive {
                        pf_warn!(self.cm.me;
                            "primary {} unreachable ({}/{})",
                            self.cm.peer_addr,
                            self.health.failures,
                            self.health.threshold
                        );
                    }
                }

                HealthAction::TakeOver => {
                    pf_warn!(self.cm.me;
                        "primary {} unreachable {} times in a row",
                        self.cm.peer_addr,
                        self.health.threshold
                    );
                    if let Err(e) = self.cm.declare_cm(self.cm.my_addr).await {
                        pf_error!(self.cm.me; "error taking over: {}", e);
                    }
                }

                HealthAction::HandBack => {
                    if let Err(e) = self.cm.hand_back().await {
                        pf_warn!(self.cm.me;
                                 "error handing back to primary: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod failover_tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::message::NodePtr;
    use crate::registry::NodeRegistry;

    fn test_manager(role: CmRole, port: u16) -> Result<CentralManager, DsmError> {
        let path = std::env::temp_dir().join(format!("ivydsm-fo-{}.json", port));
        let _ = std::fs::remove_file(&path);
        Ok(CentralManager::new(
            role,
            format!("127.0.0.1:{}", port).parse()?,
            "127.0.0.1:1".parse()?,
            NodeRegistry::new(path),
            ManagerConfig::default(),
        ))
    }

    fn sample_snapshot() -> Result<DirectorySnapshot, DsmError> {
        let mut snapshot = DirectorySnapshot::default();
        let owner = NodePtr::new(4, "127.0.0.1:8006".parse()?);
        snapshot.records.insert(
            1,
            crate::manager::Record {
                owner,
                copies: Default::default(),
            },
        );
        Ok(snapshot)
    }

    #[test]
    fn single_miss_does_not_take_over() {
        let mut health = HealthTracker::new(2);
        assert_eq!(health.on_ping(CmRole::Standby, false), HealthAction::Idle);
        assert_eq!(health.failures, 1);
        // an answer in between resets the count
        assert_eq!(health.on_ping(CmRole::Standby, true), HealthAction::Idle);
        assert_eq!(health.failures, 0);
        assert_eq!(health.on_ping(CmRole::Standby, false), HealthAction::Idle);
    }

    #[test]
    fn takes_over_on_threshold_misses_in_a_row() {
        let mut health = HealthTracker::new(3);
        for _ in 0..2 {
            assert_eq!(
                health.on_ping(CmRole::Standby, false),
                HealthAction::Idle
            );
        }
        assert_eq!(
            health.on_ping(CmRole::Standby, false),
            HealthAction::TakeOver
        );
        assert_eq!(health.failures, 0);

        let mut health = HealthTracker::new(1);
        assert_eq!(
            health.on_ping(CmRole::Standby, false),
            HealthAction::TakeOver
        );
    }

    #[test]
    fn promoted_hands_back_once_primary_answers() {
        let mut health = HealthTracker::new(2);
        assert_eq!(health.on_ping(CmRole::Promoted, false), HealthAction::Idle);
        assert_eq!(health.on_ping(CmRole::Promoted, false), HealthAction::Idle);
        assert_eq!(health.failures, 0);
        assert_eq!(
            health.on_ping(CmRole::Promoted, true),
            HealthAction::HandBack
        );
        assert_eq!(health.on_ping(CmRole::Primary, false), HealthAction::Idle);
    }

    #[test]
    fn acting_roles() {
        assert!(CmRole::Primary.is_acting());
        assert!(CmRole::Promoted.is_acting());
        assert!(!CmRole::Standby.is_acting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn standby_installs_pushes() -> Result<(), DsmError> {
        let cm = test_manager(CmRole::Standby, 52730)?;
        let snapshot = sample_snapshot()?;
        cm.handle_backup(snapshot.clone()).await;
        assert_eq!(cm.directory.lock().await.snapshot(), snapshot);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn promoted_ignores_pushes() -> Result<(), DsmError> {
        let cm = test_manager(CmRole::Standby, 52731)?;
        cm.declare_cm(cm.my_addr).await?;
        assert_eq!(*cm.role.lock().await, CmRole::Promoted);

        cm.handle_backup(sample_snapshot()?).await;
        assert!(cm.directory.lock().await.records().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn declare_someone_else() -> Result<(), DsmError> {
        let cm = test_manager(CmRole::Standby, 52732)?;
        assert!(cm.declare_cm("127.0.0.1:52733".parse()?).await.is_err());
        assert_eq!(*cm.role.lock().await, CmRole::Standby);
        Ok(())
    }
}
