//! Framed TCP bind/read/write helper functions.
//!
//! Every frame is an 8-byte big-endian length followed by the MessagePack
//! encoding of the object.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::DsmError;

use bytes::{Bytes, BytesMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::time::{self, Duration};

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the consumed bytes are
///     removed from the read buffer
///   - `Err(err)` if any unexpected error occurs, including the peer closing
///     the connection before a whole frame arrived
///
/// CANCELLATION SAFETY: bytes already read before a cancellation at an
/// `.await` point stay in `read_buf` and are continued from by the next call.
pub(crate) async fn read_frame<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, DsmError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(DsmError::msg("connection closed before frame length"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let obj_len = usize::try_from(u64::from_be_bytes(len_bytes))
        .map_err(DsmError::msg)?;

    // then read the obj itself
    let obj_end = 8 + obj_len;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(DsmError::msg("connection closed before frame body"));
        }
    }
    let obj = rmp_serde::from_slice(&read_buf[8..obj_end])?;

    // no more awaits ahead; discard bytes used in this call
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends an object of type `T` as one frame to TCP writable connection
/// `conn_write`.
pub(crate) async fn write_frame<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), DsmError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = rmp_serde::to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpSocket::listen()` that provides a retrying logic.
/// A failed bind is not retried: the address is taken and the caller should
/// give up.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, DsmError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;

        if let Err(e) = socket.bind(bind_addr) {
            return Err(DsmError::ListenerError(format!(
                "binding {} failed: {}",
                bind_addr, e
            )));
        }

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(DsmError::ListenerError(format!(
                        "listening on {} failed: {}",
                        bind_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;
    use tokio::net::TcpStream;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestFrame {
        page: u32,
        note: String,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_back_to_back() -> Result<(), DsmError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:52700".parse()?, 0).await?;
        let sender = tokio::spawn(async move {
            let mut stream = TcpStream::connect("127.0.0.1:52700").await?;
            for page in 0..3 {
                let frame = TestFrame {
                    page,
                    note: "x".repeat(page as usize * 100),
                };
                write_frame(&mut stream, &frame).await?;
            }
            Ok::<(), DsmError>(())
        });

        let (mut stream, _) = listener.accept().await?;
        let mut read_buf = BytesMut::new();
        for page in 0..3 {
            let frame: TestFrame =
                read_frame(&mut read_buf, &mut stream).await?;
            assert_eq!(frame.page, page);
            assert_eq!(frame.note.len(), page as usize * 100);
        }
        sender.await??;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_mid_frame() -> Result<(), DsmError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:52701".parse()?, 0).await?;
        let sender = tokio::spawn(async move {
            let mut stream = TcpStream::connect("127.0.0.1:52701").await?;
            stream.write_u64(64).await?; // promise a body that never comes
            Ok::<(), DsmError>(())
        });

        let (mut stream, _) = listener.accept().await?;
        sender.await??;
        let mut read_buf = BytesMut::new();
        let result: Result<TestFrame, DsmError> =
            read_frame(&mut read_buf, &mut stream).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_taken_address() -> Result<(), DsmError> {
        let _held = TcpListener::bind("127.0.0.1:52702").await?;
        let result = tcp_bind_with_retry("127.0.0.1:52702".parse()?, 0).await;
        assert!(matches!(result, Err(DsmError::ListenerError(_))));
        Ok(())
    }
}
