//! Synchronous-style RPC gateway between nodes: one request and one reply
//! per TCP connection.

mod server;

use std::net::SocketAddr;

use crate::message::{RpcReply, RpcRequest};
use crate::utils::{read_frame, write_frame, DsmError};

use async_trait::async_trait;

use bytes::BytesMut;

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

pub use server::RpcServer;

/// Request handling logic of a node, to be served by an `RpcServer`.
/// Returning `Ok(())` replies `Ack`; returning an error replies `Failed`.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, req: RpcRequest) -> Result<(), DsmError>;
}

/// Calls the node at `addr` with `req` and waits for its reply. Transport
/// failures (refused, closed early, timed out) come back as
/// `DsmError::PeerUnreachable`; an error returned by the remote handler
/// comes back as-is. There is no retry.
pub async fn rpc_call(
    addr: SocketAddr,
    req: &RpcRequest,
    timeout: Duration,
) -> Result<(), DsmError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut conn_read, mut conn_write) = stream.split();
        write_frame(&mut conn_write, req).await?;
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        read_frame::<RpcReply, _>(&mut read_buf, &mut conn_read).await
    };

    match time::timeout(timeout, exchange).await {
        Err(_) => Err(DsmError::unreachable(addr, "timed out")),
        Ok(Err(e)) => Err(DsmError::unreachable(addr, e)),
        Ok(Ok(RpcReply::Ack)) => Ok(()),
        Ok(Ok(RpcReply::Failed(e))) => Err(e),
    }
}

#[cfg(test)]
mod rpc_tests {
    use super::*;
    use crate::message::Message;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Records what it was called with; refuses READs.
    struct Recorder {
        seen: Mutex<Vec<RpcRequest>>,
    }

    #[async_trait]
    impl RpcHandler for Recorder {
        async fn handle(&self, req: RpcRequest) -> Result<(), DsmError> {
            self.seen.lock().await.push(req.clone());
            match req {
                RpcRequest::Protocol(Message::Read { page, .. }) => {
                    Err(DsmError::PageNotFound(page))
                }
                _ => Ok(()),
            }
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(1000);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_ack_and_failed() -> Result<(), DsmError> {
        let handler = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let server = RpcServer::new_and_setup(
            "recorder",
            "127.0.0.1:52710".parse()?,
            handler.clone(),
        )
        .await?;
        let addr = server.local_addr();

        rpc_call(addr, &RpcRequest::Ping, TIMEOUT).await?;
        rpc_call(addr, &RpcRequest::Ping, TIMEOUT).await?; // ping is idempotent
        let from = crate::message::NodePtr::new(1, "127.0.0.1:1".parse()?);
        let result = rpc_call(
            addr,
            &RpcRequest::Protocol(Message::Read { from, page: 9 }),
            TIMEOUT,
        )
        .await;
        assert_eq!(result, Err(DsmError::PageNotFound(9)));
        assert_eq!(handler.seen.lock().await.len(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_nobody_listening() -> Result<(), DsmError> {
        let result =
            rpc_call("127.0.0.1:52711".parse()?, &RpcRequest::Ping, TIMEOUT)
                .await;
        assert!(matches!(result, Err(DsmError::PeerUnreachable { .. })));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rebooting_refuses_then_recovers() -> Result<(), DsmError> {
        let handler = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let server = RpcServer::new_and_setup(
            "recorder",
            "127.0.0.1:52712".parse()?,
            handler.clone(),
        )
        .await?;
        let addr = server.local_addr();

        server.set_rebooting(true);
        assert!(server.is_rebooting());
        let result = rpc_call(addr, &RpcRequest::Ping, TIMEOUT).await;
        assert!(matches!(result, Err(DsmError::PeerUnreachable { .. })));
        assert!(handler.seen.lock().await.is_empty());

        server.set_rebooting(false);
        rpc_call(addr, &RpcRequest::Ping, TIMEOUT).await?;
        assert_eq!(handler.seen.lock().await.len(), 1);
        Ok(())
    }
}
