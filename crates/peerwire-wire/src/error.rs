//! Errors from the transport layer.

use crate::engine::EngineError;
use peerwire_types::PeerwireError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while establishing connections or running a node.
///
/// Failures on an established connection are never surfaced this way: they
/// converge on the connection's teardown path instead.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine rejected connection: {0}")]
    Rejected(EngineError),
    #[error("Connection closed before it was established")]
    ClosedDuringSetup,
    #[error("Socket has no resolvable peer address")]
    NoPeerAddress,
    #[error("Connect to {addr} timed out after {secs}s")]
    ConnectTimeout { addr: SocketAddr, secs: u64 },
    #[error("Connection limit reached ({max})")]
    AtCapacity { max: usize },
    #[error(transparent)]
    Config(#[from] PeerwireError),
}
