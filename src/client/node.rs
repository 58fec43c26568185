//! Client node: serves coherence messages against its page cache and runs
//! the random access workload.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::client::{LatencyStats, PageCache, Workload};
use crate::message::{Message, NodeId, NodePtr, PageId, Permission, RpcRequest};
use crate::rpc::{rpc_call, RpcHandler, RpcServer};
use crate::utils::DsmError;

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::{watch, Mutex};
use tokio::time::{self, Duration, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Pages are drawn from `0..num_pages`.
    pub num_pages: PageId,

    /// Chance in percent that an access is a read.
    pub read_percentage: u8,

    /// Accesses per workload run; 0 means run until terminated.
    pub num_requests: u64,

    /// Pause between accesses in millisecs.
    pub interval_ms: u64,

    /// Timeout of every outgoing call in millisecs.
    pub rpc_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            num_pages: 4,
            read_percentage: 50,
            num_requests: 10,
            interval_ms: 1000,
            rpc_timeout_ms: 2000,
        }
    }
}

/// Request handling side of a client. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClientCache {
    me: NodePtr,

    /// Logging identity, "n<id>".
    name: String,

    config: ClientConfig,

    /// Address of the acting manager.
    server_addr: Arc<Mutex<SocketAddr>>,

    /// Never held across a call.
    cache: Arc<Mutex<PageCache>>,

    stats: Arc<Mutex<LatencyStats>>,

    /// Set while a workload run is in progress.
    running: Arc<AtomicBool>,

    /// Receiver side of the termination channel, stops workload runs.
    rx_term: watch::Receiver<bool>,
}

impl ClientCache {
    pub fn new(
        me: NodePtr,
        server_addr: SocketAddr,
        config: ClientConfig,
        rx_term: watch::Receiver<bool>,
    ) -> Self {
        ClientCache {
            me,
            name: format!("n{}", me.id),
            config,
            server_addr: Arc::new(Mutex::new(server_addr)),
            cache: Arc::new(Mutex::new(PageCache::new())),
            stats: Arc::new(Mutex::new(LatencyStats::new())),
            running: Arc::new(AtomicBool::new(false)),
            rx_term,
        }
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    /// Address of the manager calls currently go to.
    pub async fn server_addr(&self) -> SocketAddr {
        *self.server_addr.lock().await
    }

    /// Retargets future manager calls to `addr`.
    pub async fn update_server_addr(&self, addr: SocketAddr) {
        let mut server_addr = self.server_addr.lock().await;
        if *server_addr != addr {
            pf_warn!(self.name; "manager moved {} -> {}", *server_addr, addr);
            *server_addr = addr;
        }
    }

    async fn send_to_cm(&self, msg: Message) -> Result<(), DsmError> {
        let addr = self.server_addr().await;
        pf_trace!(self.name; "send {} -> cm {}", msg, addr);
        rpc_call(addr, &RpcRequest::Protocol(msg), self.rpc_timeout()).await
    }

    async fn send_page(
        &self,
        to: NodePtr,
        page: PageId,
        perm: Permission,
    ) -> Result<(), DsmError> {
        let msg = Message::ReceivePage { page, perm };
        pf_trace!(self.name; "send {} {} -> {}", msg, perm, to);
        rpc_call(to.addr, &RpcRequest::Protocol(msg), self.rpc_timeout()).await
    }

    /// Permission currently held on `page`.
    pub async fn cached(&self, page: PageId) -> Option<Permission> {
        self.cache.lock().await.get(page)
    }

    /// Copy of the whole cache.
    pub async fn cache_entries(&self) -> BTreeMap<PageId, Permission> {
        self.cache.lock().await.entries()
    }

    /// Makes one access. Served locally on a cache hit (returns true);
    /// otherwise asks the manager and returns once it accepted the request.
    /// The page itself arrives later through a RECEIVE_PAGE.
    pub async fn access(
        &self,
        page: PageId,
        perm: Permission,
    ) -> Result<bool, DsmError> {
        if self.cache.lock().await.hits(page, perm) {
            pf_debug!(self.name; "page {} cached, {} served locally",
                      page, perm);
            return Ok(true);
        }

        self.stats.lock().await.start(page, perm);
        let msg = match perm {
            Permission::Read => Message::Read {
                from: self.me,
                page,
            },
            Permission::Write => Message::Write {
                from: self.me,
                page,
            },
        };
        if let Err(e) = self.send_to_cm(msg).await {
            self.stats.lock().await.cancel(page, perm);
            return Err(e);
        }
        Ok(false)
    }

    /// Handles one coherence protocol message.
    pub async fn receive_request(&self, msg: Message) -> Result<(), DsmError> {
        pf_debug!(self.name; "recv {}", msg);
        match msg {
            Message::Ping => Ok(()),

            Message::ReceivePage { page, perm } => {
                self.cache.lock().await.grant(page, perm);
                if let Some(elapsed) = self.stats.lock().await.finish(page, perm) {
                    pf_debug!(self.name; "{} page {} took {:?}",
                              perm, page, elapsed);
                }

                let from = self.me;
                let confirmation = match perm {
                    Permission::Read => Message::ReadConfirmation { from, page },
                    Permission::Write => Message::WriteConfirmation { from, page },
                };
                match self.send_to_cm(confirmation).await {
                    Ok(()) => Ok(()),
                    Err(e) if perm == Permission::Read => {
                        // an unconfirmed copy is not kept
                        let mut cache = self.cache.lock().await;
                        if cache.get(page) == Some(Permission::Read) {
                            cache.evict(page);
                        }
                        Err(e)
                    }
                    Err(e) => {
                        pf_error!(self.name;
                                  "WRITE_CONFIRMATION page {} failed: {}",
                                  page, e);
                        Ok(())
                    }
                }
            }

            // a relay that errors may still have landed (e.g. timed out
            // while the requester confirms), so the local entry is never
            // put back after giving the page away
            Message::ReadForward { page, requester } => {
                if self.cache.lock().await.demote(page).is_none() {
                    pf_warn!(self.name;
                             "READ_FORWARD page {} but page not cached", page);
                }
                self.send_page(requester, page, Permission::Read).await
            }

            Message::WriteForward { page, requester } => {
                if requester == self.me {
                    return self.send_page(requester, page, Permission::Write).await;
                }

                let old = self.cache.lock().await.evict(page);
                if old != Some(Permission::Write) {
                    pf_warn!(self.name;
                        "WRITE_FORWARD page {} while holding {:?}",
                        page,
                        old
                    );
                }
                self.send_page(requester, page, Permission::Write).await
            }

            Message::InvalidateCache { page } => {
                self.cache.lock().await.evict(page);
                self.send_to_cm(Message::InvalidateConfirmation {
                    from: self.me,
                    page,
                })
                .await
            }

            _ => logged_err!(self.name; "unexpected {} at client", msg),
        }
    }

    /// Runs the workload: `num_requests` accesses (unbounded if 0), one per
    /// `interval_ms`, then reports latency stats to the manager. Returns
    /// false without doing anything if a run is already in progress.
    pub async fn request_page(&self) -> Result<bool, DsmError> {
        if self.running.swap(true, Ordering::SeqCst) {
            pf_warn!(self.name; "workload already running");
            return Ok(false);
        }

        let mut workload =
            Workload::new(self.config.num_pages, self.config.read_percentage);
        let mut interval =
            time::interval(Duration::from_millis(self.config.interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rx_term = self.rx_term.clone();
        pf_info!(self.name; "workload started");

        let mut done = 0;
        while self.config.num_requests == 0 || done < self.config.num_requests {
            tokio::select! {
                _ = interval.tick() => {},
                _ = rx_term.changed() => break,
            }

            let (page, perm) = workload.next_op();
            pf_debug!(self.name; "wants {} on page {}", perm, page);
            if let Err(e) = self.access(page, perm).await {
                pf_warn!(self.name; "{} request page {} failed: {}",
                         perm, page, e);
            }
            done += 1;
        }

        pf_info!(self.name; "workload done after {} accesses", done);
        // give the last grants a chance to arrive
        time::sleep(Duration::from_millis(self.config.interval_ms)).await;
        let report = self.stats.lock().await.report(self.me.id);
        self.running.store(false, Ordering::SeqCst);

        let addr = self.server_addr().await;
        rpc_call(addr, &RpcRequest::ReportStats(report), self.rpc_timeout())
            .await?;
        Ok(true)
    }

    /// Starts `request_page()` in the background.
    pub fn spawn_workload(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.request_page().await {
                pf_error!(client.name; "error running workload: {}", e);
            }
        });
    }
}

#[async_trait]
impl RpcHandler for ClientCache {
    async fn handle(&self, req: RpcRequest) -> Result<(), DsmError> {
        match req {
            RpcRequest::Ping => Ok(()),
            RpcRequest::Protocol(msg) => self.receive_request(msg).await,
            RpcRequest::UpdateServerAddr { addr } => {
                self.update_server_addr(addr).await;
                Ok(())
            }
            RpcRequest::StartWorkload => {
                self.spawn_workload();
                Ok(())
            }
            req => {
                logged_err!(self.name; "unexpected request {:?} at client", req)
            }
        }
    }
}

/// A running client: request handling plus its listener.
pub struct ClientNode {
    client: ClientCache,

    server: RpcServer,

    /// Sender side of the termination channel.
    tx_term: watch::Sender<bool>,
}

impl ClientNode {
    /// Starts client `me`, listening on `me.addr` and talking to the
    /// manager at `manager`. `config_str` is an optional TOML string
    /// overriding `ClientConfig` defaults.
    pub async fn new_and_setup(
        me: NodePtr,
        manager: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, DsmError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    num_pages, read_percentage, num_requests,
                                    interval_ms, rpc_timeout_ms)?;
        let name = format!("n{}", me.id);
        if config.num_pages == 0 {
            return logged_err!(name; "invalid config.num_pages '{}'",
                               config.num_pages);
        }
        if config.read_percentage > 100 {
            return logged_err!(name;
                "invalid config.read_percentage '{}'",
                config.read_percentage
            );
        }

        let (tx_term, rx_term) = watch::channel(false);
        let client = ClientCache::new(me, manager, config, rx_term);
        let server =
            RpcServer::new_and_setup(&name, me.addr, Arc::new(client.clone()))
                .await?;

        pf_info!(name; "client {} up, manager at {}", me, manager);
        Ok(ClientNode {
            client,
            server,
            tx_term,
        })
    }

    pub fn id(&self) -> NodeId {
        self.client.me.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Shared handle on the request handling side.
    pub fn client(&self) -> &ClientCache {
        &self.client
    }

    /// Makes one access, see `ClientCache::access()`.
    pub async fn access(
        &self,
        page: PageId,
        perm: Permission,
    ) -> Result<bool, DsmError> {
        self.client.access(page, perm).await
    }

    pub async fn cached(&self, page: PageId) -> Option<Permission> {
        self.client.cached(page).await
    }

    /// Stops any running workload. The listener goes away on drop.
    pub fn terminate(&self) {
        let _ = self.tx_term.send(true);
    }
}
