//! Este modulo contiene los tipos de fallas que puede reportar un
//! transporte o un manejador remoto.
use std::fmt;

/// Fallas de transporte, tal como las observa el llamador de una RPC.
///
/// `ConnectionRefused` y `ServiceNotConnected` son las dos well-known
/// "connection fault" tags: cualquier otra falla se propaga tal cual al
/// llamador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    ConnectionRefused,
    ServiceNotConnected,
    Other(String),
}

impl TransportFault {
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            TransportFault::ConnectionRefused | TransportFault::ServiceNotConnected
        )
    }
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::ConnectionRefused => write!(f, "connection refused"),
            TransportFault::ServiceNotConnected => write!(f, "service not connected"),
            TransportFault::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for TransportFault {}

/// Falla devuelta por el manejador remoto de una RPC (no de transporte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFault {
    InvalidPathInfo { expected_version: u32 },
    CommitRejected(String),
    MajorityUnavailable,
    NoBlockServersAvailable,
    LeaderMismatch,
    NotFound(String),
    Other(String),
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFault::InvalidPathInfo { expected_version } => {
                write!(f, "invalid path info, expected version {expected_version}")
            }
            RemoteFault::CommitRejected(reason) => write!(f, "commit rejected: {reason}"),
            RemoteFault::MajorityUnavailable => write!(f, "majority not available"),
            RemoteFault::NoBlockServersAvailable => write!(f, "no block servers available"),
            RemoteFault::LeaderMismatch => write!(f, "not the root leader for this path"),
            RemoteFault::NotFound(what) => write!(f, "not found: {what}"),
            RemoteFault::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RemoteFault {}
