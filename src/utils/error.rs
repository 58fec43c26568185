//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net::{self, SocketAddr};
use std::num;
use std::string;

use crate::message::PageId;

use serde::{Deserialize, Serialize};

/// Customized error type for Ivydsm. Serializable so that a failure can be
/// carried back to the caller inside an RPC reply.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum DsmError {
    /// READ against a page that has no directory record.
    PageNotFound(PageId),

    /// RPC to a client or manager failed at the transport level.
    PeerUnreachable { addr: SocketAddr, reason: String },

    /// Cannot bind the service address.
    ListenerError(String),

    /// Any other run-time error, as its string representation.
    Msg(String),
}

impl DsmError {
    pub fn msg(msg: impl ToString) -> Self {
        DsmError::Msg(msg.to_string())
    }

    pub fn unreachable(addr: SocketAddr, reason: impl ToString) -> Self {
        DsmError::PeerUnreachable {
            addr,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for DsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DsmError::PageNotFound(page) => {
                write!(f, "page {} not found", page)
            }
            DsmError::PeerUnreachable { addr, reason } => {
                write!(f, "peer {} unreachable: {}", addr, reason)
            }
            DsmError::ListenerError(reason) => {
                write!(f, "listener error: {}", reason)
            }
            DsmError::Msg(msg) => write!(f, "{}", msg), // no literal quotes
        }
    }
}

impl error::Error for DsmError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `DsmError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for DsmError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                DsmError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `DsmError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for DsmError {
            fn from(e: $error) -> DsmError {
                DsmError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(serde_json::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() -> Result<(), DsmError> {
        let e = DsmError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = DsmError::PageNotFound(7);
        assert_eq!(format!("{}", e), String::from("page 7 not found"));
        let e = DsmError::unreachable("127.0.0.1:8003".parse()?, "refused");
        assert_eq!(
            format!("{}", e),
            String::from("peer 127.0.0.1:8003 unreachable: refused")
        );
        Ok(())
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = DsmError::from(io_error);
        assert!(matches!(e, DsmError::Msg(ref s) if s.contains("oh no!")));
    }

    #[test]
    fn wire_roundtrip_keeps_kind() -> Result<(), DsmError> {
        let e = DsmError::PageNotFound(3);
        let bytes = rmp_serde::to_vec(&e)?;
        let back: DsmError = rmp_serde::from_slice(&bytes)?;
        assert_eq!(back, e);
        Ok(())
    }
}
