//! The protocol engine boundary.
//!
//! The engine owns framing, encryption and message semantics. The transport
//! only moves opaque bytes in and out of it and obeys its pause/resume and
//! disconnect decisions. Every call is synchronous: the engine may call back
//! into [`SocketHandle`] from inside any of these methods.

use crate::connection::SocketHandle;
use peerwire_types::PeerId;
use std::net::SocketAddr;
use thiserror::Error;

/// An error reported by the protocol engine.
///
/// Opaque to the transport: any engine error is fatal to the connection it
/// was reported for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Trait implemented by the peer-to-peer protocol engine.
///
/// The transport calls these methods as connections are established and as
/// bytes arrive. Implementations identify connections by [`SocketHandle`],
/// whose equality and hash depend only on the connection id.
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Register a freshly accepted connection. `Err` rejects it.
    fn register_inbound(
        &self,
        handle: SocketHandle,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(), EngineError>;

    /// Register a freshly dialed connection to `peer`.
    ///
    /// On success returns the bytes the transport must write before the
    /// connection is used (the first handshake message), possibly empty.
    fn register_outbound(
        &self,
        peer: &PeerId,
        handle: SocketHandle,
        peer_addr: SocketAddr,
    ) -> Result<Vec<u8>, EngineError>;

    /// Deliver bytes read from `handle`.
    ///
    /// `Ok(true)` asks the transport to stop reading until the engine
    /// calls `send_data(_, true)` on the handle. A resume issued before
    /// this call returns already counts.
    fn feed_bytes(&self, handle: &SocketHandle, data: &[u8]) -> Result<bool, EngineError>;

    /// Run any actions queued while handling inbound bytes, including
    /// writes back through [`SocketHandle::send_data`].
    fn process_pending_events(&self);

    /// Called after a short write once the transport can take more bytes.
    ///
    /// [`SocketHandle::send_data`] never buffers: when it returns fewer
    /// bytes than it was given, the engine keeps the tail and sends it again
    /// from here. Runs on the connection's own task, never from inside
    /// `send_data`.
    fn write_buffer_space_avail(&self, _handle: &SocketHandle) {}

    /// Called once when a registered connection goes away for a reason the
    /// engine did not initiate itself. Never called for connections the
    /// engine closed through [`SocketHandle::disconnect`].
    ///
    /// Delivered from the connection's read task after its loop has exited,
    /// never from inside another engine call or `send_data`, so the engine
    /// may hold its own locks while it writes.
    fn socket_disconnected(&self, _handle: &SocketHandle) {}
}
