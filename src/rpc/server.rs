//! RPC listener: an acceptor task plus one responder task per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::message::{RpcReply, RpcRequest};
use crate::rpc::RpcHandler;
use crate::utils::{read_frame, tcp_bind_with_retry, write_frame, DsmError};

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Listening side of the RPC gateway of a node.
pub struct RpcServer {
    /// Actual bound address.
    local_addr: SocketAddr,

    /// Simulated outage gate, shared with the acceptor task. While set,
    /// connections are accepted and immediately closed.
    rebooting: Arc<AtomicBool>,

    /// Join handle of the acceptor task.
    acceptor_handle: JoinHandle<()>,
}

impl RpcServer {
    /// Binds `bind_addr` and spawns the acceptor task serving `handler`,
    /// logging as `me`. Fails with `DsmError::ListenerError` if the address
    /// cannot be bound.
    pub async fn new_and_setup<H: RpcHandler>(
        me: impl ToString,
        bind_addr: SocketAddr,
        handler: Arc<H>,
    ) -> Result<Self, DsmError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        let rebooting = Arc::new(AtomicBool::new(false));

        let acceptor = RpcAcceptorTask {
            me: me.to_string(),
            listener,
            handler,
            rebooting: rebooting.clone(),
        };
        let acceptor_handle = tokio::spawn(acceptor.run());

        Ok(RpcServer {
            local_addr,
            rebooting,
            acceptor_handle,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Enters or leaves the simulated outage mode. In-memory state of the
    /// handler is untouched either way.
    pub fn set_rebooting(&self, rebooting: bool) {
        self.rebooting.store(rebooting, Ordering::SeqCst);
    }

    pub fn is_rebooting(&self) -> bool {
        self.rebooting.load(Ordering::SeqCst)
    }

    /// Shared handle on the outage gate, for loops that pause during it.
    pub fn reboot_gate(&self) -> Arc<AtomicBool> {
        self.rebooting.clone()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        // stops accepting; in-progress responders finish on their own
        self.acceptor_handle.abort();
    }
}

/// RpcServer acceptor task.
struct RpcAcceptorTask<H> {
    me: String,
    listener: TcpListener,
    handler: Arc<H>,
    rebooting: Arc<AtomicBool>,
}

impl<H: RpcHandler> RpcAcceptorTask<H> {
    /// Starts the acceptor task loop.
    async fn run(self) {
        pf_debug!(self.me; "rpc acceptor on '{:?}' spawned",
                  self.listener.local_addr());

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    pf_warn!(self.me; "error accepting connection: {}", e);
                    continue;
                }
            };

            if self.rebooting.load(Ordering::SeqCst) {
                // simulated outage: hang up right away
                drop(stream);
                continue;
            }

            tokio::spawn(Self::serve_conn(
                self.me.clone(),
                self.handler.clone(),
                stream,
                addr,
            ));
        }
    }

    /// Per-connection responder: reads one request, runs the handler, and
    /// writes back one reply.
    async fn serve_conn(
        me: String,
        handler: Arc<H>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) {
        let (mut conn_read, mut conn_write) = stream.split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        let req: RpcRequest = match read_frame(&mut read_buf, &mut conn_read).await
        {
            Ok(req) => req,
            Err(e) => {
                pf_warn!(me; "error reading request from {}: {}", addr, e);
                return;
            }
        };
        pf_trace!(me; "recv req {:?} from {}", req, addr);

        let reply = match handler.handle(req).await {
            Ok(()) => RpcReply::Ack,
            Err(e) => RpcReply::Failed(e),
        };

        if let Err(e) = write_frame(&mut conn_write, &reply).await {
            pf_warn!(me; "error replying to {}: {}", addr, e);
        }
    }
}
