//! Echo engine: writes every received chunk back to its sender.
//!
//! Stands in for a real protocol engine when exercising a node from the
//! command line. It never pauses reading. Bytes the socket could not take
//! yet stay in a per-connection outbox and are retried when the transport
//! reports free buffer space.

use peerwire_types::{ConnectionId, PeerId};
use peerwire_wire::{EngineError, ProtocolEngine, SocketHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::{debug, info};

/// Unsent bytes for one connection.
struct Outbox {
    handle: SocketHandle,
    pending: Vec<u8>,
}

impl Outbox {
    /// Send as much of the backlog as the socket takes.
    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let written = self.handle.send_data(&self.pending, true);
        self.pending.drain(..written);
        if !self.pending.is_empty() {
            debug!(
                conn = %self.handle.id(),
                backlog = self.pending.len(),
                "echo: socket full, holding backlog"
            );
        }
    }
}

#[derive(Default)]
pub struct EchoEngine {
    outboxes: Mutex<HashMap<ConnectionId, Outbox>>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, handle: SocketHandle) {
        self.outboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                handle.id(),
                Outbox {
                    handle,
                    pending: Vec::new(),
                },
            );
    }
}

impl ProtocolEngine for EchoEngine {
    fn register_inbound(
        &self,
        handle: SocketHandle,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(), EngineError> {
        info!(conn = %handle.id(), peer = ?peer_addr, "echo: peer connected");
        self.track(handle);
        Ok(())
    }

    fn register_outbound(
        &self,
        peer: &PeerId,
        handle: SocketHandle,
        peer_addr: SocketAddr,
    ) -> Result<Vec<u8>, EngineError> {
        info!(conn = %handle.id(), peer = %peer_addr, peer_id = %peer, "echo: dialed peer");
        self.track(handle);
        Ok(Vec::new())
    }

    fn feed_bytes(&self, handle: &SocketHandle, data: &[u8]) -> Result<bool, EngineError> {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(|e| e.into_inner());
        match outboxes.get_mut(&handle.id()) {
            Some(outbox) => outbox.pending.extend_from_slice(data),
            None => return Err(EngineError::new("bytes for an unknown connection")),
        }
        Ok(false)
    }

    fn process_pending_events(&self) {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(|e| e.into_inner());
        for outbox in outboxes.values_mut() {
            outbox.flush();
        }
    }

    fn write_buffer_space_avail(&self, handle: &SocketHandle) {
        let mut outboxes = self.outboxes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(outbox) = outboxes.get_mut(&handle.id()) {
            outbox.flush();
        }
    }

    fn socket_disconnected(&self, handle: &SocketHandle) {
        let dropped = self
            .outboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id())
            .map_or(0, |outbox| outbox.pending.len());
        info!(conn = %handle.id(), unsent = dropped, "echo: peer disconnected");
    }
}
