//! Connection: one socket bridged to the protocol engine.
//!
//! A [`Connection`] owns a split [`DuplexTransport`] and runs three
//! background tasks:
//!
//! - the **read loop** feeds every chunk read from the socket to
//!   [`ProtocolEngine::feed_bytes`], then lets the engine flush its queued
//!   work with [`ProtocolEngine::process_pending_events`]. When the engine
//!   asks for a pause, the loop parks on the [`ReadGate`] until the engine
//!   resumes it through [`SocketHandle::send_data`].
//! - the **write-space loop** waits for the socket to drain after a short
//!   write and then calls [`ProtocolEngine::write_buffer_space_avail`] so
//!   the engine can send the rest.
//! - the **liveness loop** polls the transport's connectivity so a silently
//!   vanished peer is noticed even when nothing is being read.
//!
//! All three are spawned dormant and only start once the engine has
//! accepted the connection and it has been published to the registry.
//!
//! Every failure (engine error, socket closure, write failure, liveness loss,
//! explicit disconnect) converges on a single idempotent teardown: the first
//! caller cancels the loops, closes the transport and removes the connection
//! from the registry. Later callers are no-ops. The engine hears about the
//! disconnect afterwards, from the read task once its loop has exited, so
//! teardown never re-enters the engine from inside one of its own calls.

use crate::engine::{EngineError, ProtocolEngine};
use crate::error::WireError;
use crate::gate::ReadGate;
use crate::registry::ConnectionStore;
use crate::transport::{is_transient, DuplexTransport, TransportReader, TransportWriter};
use chrono::{DateTime, Utc};
use peerwire_types::{ConnectionId, PeerId, TransportConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type RemovalCallback = Box<dyn FnOnce(ConnectionId) + Send>;

/// Teardown progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    /// Live (or being established).
    Active,
    /// Teardown has started; loops are cancelled.
    Disconnecting,
    /// Transport closed and registry entry removed.
    Closed,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Application code closed it.
    Local,
    /// The engine asked for it through [`SocketHandle::disconnect`].
    EngineRequested,
    /// The engine reported an error for inbound bytes.
    EngineError,
    /// The peer closed the stream or the socket failed while reading.
    TransportClosed,
    /// Writing to the socket failed.
    WriteFailed,
    /// The liveness loop found the transport disconnected.
    LivenessLost,
    /// The engine declined to register the connection.
    Rejected,
}

impl DisconnectReason {
    /// Whether the engine must be told about this disconnect. It already
    /// knows about the ones it caused, and never knew rejected connections.
    fn notifies_engine(self) -> bool {
        !matches!(self, Self::EngineRequested | Self::Rejected)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::EngineRequested => write!(f, "engine_requested"),
            Self::EngineError => write!(f, "engine_error"),
            Self::TransportClosed => write!(f, "transport_closed"),
            Self::WriteFailed => write!(f, "write_failed"),
            Self::LivenessLost => write!(f, "liveness_lost"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// State shared by the owner, the engine's handles and the loops.
struct Shared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    direction: Direction,
    established_at: DateTime<Utc>,
    /// Taken (and closed) on teardown. The mutex is the single-writer lock.
    writer: Mutex<Option<Arc<dyn TransportWriter>>>,
    gate: ReadGate,
    /// Set by a short write, cleared when the engine is told about space.
    write_blocked: AtomicBool,
    write_space: Notify,
    /// Cancellation scope: loops stop as soon as this leaves `Active`.
    lifecycle: watch::Sender<TeardownState>,
    reason: OnceLock<DisconnectReason>,
    /// Set once the engine has accepted the connection.
    accepted: AtomicBool,
    on_remove: Mutex<Option<RemovalCallback>>,
}

/// The engine-facing side of a connection.
///
/// Cheap to clone. Equality and hashing use the connection id only, so the
/// engine can use handles as map keys.
#[derive(Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

impl SocketHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// When the connection object was created.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.shared.established_at
    }

    pub fn state(&self) -> TeardownState {
        *self.shared.lifecycle.borrow()
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.state() != TeardownState::Active
    }

    /// The reason recorded by the first teardown, if any.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.reason.get().copied()
    }

    /// Write `data` to the socket and return how many bytes were written.
    ///
    /// Writes never block and never buffer: if the socket buffer fills up
    /// the count is short, the engine keeps the unsent tail, and
    /// [`ProtocolEngine::write_buffer_space_avail`] is called once the
    /// socket drains. Concurrent callers are serialized so their bytes
    /// never interleave. A write failure closes the connection and reports
    /// 0. On a closed connection this is a no-op returning 0.
    ///
    /// With `resume_read` set, a reader paused by the engine is resumed.
    /// Resuming a reader that is not paused does nothing.
    pub fn send_data(&self, data: &[u8], resume_read: bool) -> usize {
        let written = if self.is_closed() {
            0
        } else {
            self.write_serialized(data)
        };

        if resume_read && self.shared.gate.resume() {
            debug!(conn = %self.id(), "peerwire: resuming read");
        }

        written
    }

    /// Disconnect at the engine's request. Idempotent.
    ///
    /// The engine is not called back about disconnects it asked for.
    pub fn disconnect(&self) {
        self.teardown(DisconnectReason::EngineRequested);
    }

    /// Disconnect at the application's request. Idempotent.
    ///
    /// Returns `true` if this call performed the teardown.
    pub fn close(&self) -> bool {
        self.teardown(DisconnectReason::Local)
    }

    /// Wait until teardown has fully completed.
    pub async fn closed(&self) {
        let mut rx = self.shared.lifecycle.subscribe();
        let _ = rx.wait_for(|state| *state == TeardownState::Closed).await;
    }

    fn write_serialized(&self, data: &[u8]) -> usize {
        let result = {
            let writer = self
                .shared
                .writer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match writer.as_deref() {
                Some(writer) => write_nonblocking(writer, data),
                None => return 0,
            }
        };

        match result {
            Ok(written) => {
                if written < data.len() {
                    debug!(
                        conn = %self.id(),
                        written,
                        requested = data.len(),
                        "peerwire: socket buffer full, short write"
                    );
                    self.shared.write_blocked.store(true, Ordering::SeqCst);
                    self.shared.write_space.notify_one();
                } else {
                    debug!(conn = %self.id(), bytes = written, "peerwire: sent data to peer");
                }
                written
            }
            Err(e) => {
                warn!(conn = %self.id(), error = %e, "peerwire: failed to send data");
                self.teardown(DisconnectReason::WriteFailed);
                0
            }
        }
    }

    fn current_writer(&self) -> Option<Arc<dyn TransportWriter>> {
        self.shared
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn transport_connected(&self) -> bool {
        let writer = self
            .shared
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        writer.as_ref().is_some_and(|w| w.is_connected())
    }

    /// The single teardown path. Returns `true` for the one caller that
    /// actually performed it.
    fn teardown(&self, reason: DisconnectReason) -> bool {
        let shared = &self.shared;
        let first = shared.lifecycle.send_if_modified(|state| {
            if *state == TeardownState::Active {
                *state = TeardownState::Disconnecting;
                true
            } else {
                false
            }
        });
        if !first {
            return false;
        }

        let _ = shared.reason.set(reason);
        info!(
            conn = %shared.id,
            peer = ?shared.peer_addr,
            direction = %shared.direction,
            reason = %reason,
            "peerwire: disconnecting socket"
        );

        let writer = shared
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(writer) = writer {
            writer.close();
        }

        let on_remove = shared
            .on_remove
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(on_remove) = on_remove {
            if reason != DisconnectReason::Rejected {
                on_remove(shared.id);
            }
        }

        shared.lifecycle.send_replace(TeardownState::Closed);
        true
    }

    /// Tell the engine the connection is gone, if it needs telling.
    fn notify_disconnected(&self, engine: &dyn ProtocolEngine) {
        let Some(reason) = self.disconnect_reason() else {
            return;
        };
        if reason.notifies_engine() && self.shared.accepted.load(Ordering::SeqCst) {
            debug!(conn = %self.id(), reason = %reason, "peerwire: notifying engine of disconnect");
            engine.socket_disconnected(self);
        }
    }
}

impl PartialEq for SocketHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for SocketHandle {}

impl std::hash::Hash for SocketHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Write as much of `data` as the socket takes without blocking.
fn write_nonblocking(writer: &dyn TransportWriter, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match writer.try_write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// An established connection, as seen by the code that created it.
///
/// Dropping a `Connection` does not close it: it stays alive through its
/// loops and its registry entry until teardown. Equality and hashing use
/// the connection id only.
pub struct Connection {
    handle: SocketHandle,
    start_tx: watch::Sender<bool>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    liveness_task: JoinHandle<()>,
}

impl Connection {
    /// Bridge an accepted socket to the engine.
    ///
    /// Must be called from within a Tokio runtime. On rejection the
    /// transport is closed, nothing is published and the loops exit
    /// without ever starting.
    pub fn inbound<T: DuplexTransport>(
        transport: T,
        engine: Arc<dyn ProtocolEngine>,
        store: Arc<dyn ConnectionStore>,
        config: &TransportConfig,
    ) -> Result<Connection, WireError> {
        let peer_addr = transport.peer_addr();
        let conn = Self::dormant(transport, Direction::Inbound, &engine, &store, config);

        if let Err(e) = engine.register_inbound(conn.handle.clone(), peer_addr) {
            return Err(conn.reject(e));
        }
        conn.handle.shared.accepted.store(true, Ordering::SeqCst);

        conn.publish(store.as_ref())?;
        info!(
            conn = %conn.id(),
            peer = ?peer_addr,
            "peerwire: new inbound connection accepted"
        );
        Ok(conn)
    }

    /// Bridge a dialed socket to the engine as a connection to `peer`.
    ///
    /// The engine's initial bytes are written before the connection is
    /// published; if they cannot be written in full the connection is torn
    /// down and [`WireError::ClosedDuringSetup`] is returned.
    pub fn outbound<T: DuplexTransport>(
        transport: T,
        peer: &PeerId,
        engine: Arc<dyn ProtocolEngine>,
        store: Arc<dyn ConnectionStore>,
        config: &TransportConfig,
    ) -> Result<Connection, WireError> {
        let Some(peer_addr) = transport.peer_addr() else {
            warn!(
                peer_id = %peer,
                "peerwire: no socket address, cannot create outbound connection"
            );
            return Err(WireError::NoPeerAddress);
        };
        let conn = Self::dormant(transport, Direction::Outbound, &engine, &store, config);

        let initial = match engine.register_outbound(peer, conn.handle.clone(), peer_addr) {
            Ok(initial) => initial,
            Err(e) => return Err(conn.reject(e)),
        };
        conn.handle.shared.accepted.store(true, Ordering::SeqCst);

        if !initial.is_empty() {
            let written = conn.handle.send_data(&initial, true);
            if written < initial.len() {
                warn!(
                    conn = %conn.id(),
                    written,
                    requested = initial.len(),
                    "peerwire: could not write initial handshake"
                );
                conn.handle.teardown(DisconnectReason::WriteFailed);
                return Err(WireError::ClosedDuringSetup);
            }
        }

        conn.publish(store.as_ref())?;
        info!(
            conn = %conn.id(),
            peer = %peer_addr,
            peer_id = %peer,
            "peerwire: new outbound connection accepted"
        );
        Ok(conn)
    }

    /// Build the connection with its loops spawned but not yet started.
    fn dormant<T: DuplexTransport>(
        transport: T,
        direction: Direction,
        engine: &Arc<dyn ProtocolEngine>,
        store: &Arc<dyn ConnectionStore>,
        config: &TransportConfig,
    ) -> Self {
        let peer_addr = transport.peer_addr();
        let (reader, writer) = transport.into_split();
        let writer: Arc<dyn TransportWriter> = Arc::new(writer);
        let (lifecycle, _) = watch::channel(TeardownState::Active);
        let (start_tx, _) = watch::channel(false);

        let removal_store = Arc::clone(store);
        let on_remove: RemovalCallback = Box::new(move |id| removal_store.remove(&id));

        let handle = SocketHandle {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                peer_addr,
                direction,
                established_at: Utc::now(),
                writer: Mutex::new(Some(writer)),
                gate: ReadGate::new(),
                write_blocked: AtomicBool::new(false),
                write_space: Notify::new(),
                lifecycle,
                reason: OnceLock::new(),
                accepted: AtomicBool::new(false),
                on_remove: Mutex::new(Some(on_remove)),
            }),
        };

        let read_task = tokio::spawn(read_loop(
            handle.clone(),
            reader,
            Arc::clone(engine),
            ReadSettings {
                buffer_size: config.read_buffer_size.max(1),
                backoff: config.read_backoff(),
            },
            start_tx.subscribe(),
            handle.shared.lifecycle.subscribe(),
        ));
        let write_task = tokio::spawn(write_space_loop(
            handle.clone(),
            Arc::clone(engine),
            start_tx.subscribe(),
            handle.shared.lifecycle.subscribe(),
        ));
        let liveness_task = tokio::spawn(liveness_loop(
            handle.clone(),
            config.liveness_interval(),
            start_tx.subscribe(),
            handle.shared.lifecycle.subscribe(),
        ));

        Self {
            handle,
            start_tx,
            read_task,
            write_task,
            liveness_task,
        }
    }

    fn reject(self, err: EngineError) -> WireError {
        warn!(
            conn = %self.id(),
            peer = ?self.peer_addr(),
            direction = %self.handle.direction(),
            error = %err,
            "peerwire: engine rejected connection"
        );
        self.handle.teardown(DisconnectReason::Rejected);
        WireError::Rejected(err)
    }

    /// Insert into the store, then start the loops.
    ///
    /// The teardown state is re-checked after inserting: a connection torn
    /// down while it was being set up must not linger in the store.
    fn publish(&self, store: &dyn ConnectionStore) -> Result<(), WireError> {
        store.insert(self.handle.clone());
        if self.handle.is_closed() {
            store.remove(&self.id());
            return Err(WireError::ClosedDuringSetup);
        }
        self.start_tx.send_replace(true);
        Ok(())
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// The handle given to the engine.
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.handle.peer_addr()
    }

    pub fn state(&self) -> TeardownState {
        self.handle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.handle.disconnect_reason()
    }

    /// Close the connection. Idempotent; the engine is notified.
    pub fn disconnect(&self) {
        self.handle.close();
    }

    /// Wait until teardown has fully completed.
    pub async fn closed(&self) {
        self.handle.closed().await
    }

    /// Whether every background loop has exited.
    pub fn loops_finished(&self) -> bool {
        self.read_task.is_finished()
            && self.write_task.is_finished()
            && self.liveness_task.is_finished()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Connection").field(&self.handle).finish()
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

struct ReadSettings {
    buffer_size: usize,
    backoff: Duration,
}

/// Resolves once teardown has started.
async fn cancelled(lifecycle: &mut watch::Receiver<TeardownState>) {
    let _ = lifecycle
        .wait_for(|state| *state != TeardownState::Active)
        .await;
}

/// Wait for the start signal. `false` if cancelled first.
async fn wait_for_start(
    start: &mut watch::Receiver<bool>,
    lifecycle: &mut watch::Receiver<TeardownState>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(lifecycle) => false,
        started = start.wait_for(|started| *started) => started.is_ok(),
    }
}

/// Pump bytes into the engine, then deliver the disconnect notice once
/// the connection is fully closed.
async fn read_loop<R: TransportReader>(
    handle: SocketHandle,
    reader: R,
    engine: Arc<dyn ProtocolEngine>,
    settings: ReadSettings,
    mut start: watch::Receiver<bool>,
    mut lifecycle: watch::Receiver<TeardownState>,
) {
    if wait_for_start(&mut start, &mut lifecycle).await {
        pump(&handle, reader, engine.as_ref(), &settings, &mut lifecycle).await;
    } else if !handle.is_closed() {
        // The owner went away before publishing; nothing was ever live.
        return;
    }

    let _ = lifecycle
        .wait_for(|state| *state == TeardownState::Closed)
        .await;
    handle.notify_disconnected(engine.as_ref());
}

async fn pump<R: TransportReader>(
    handle: &SocketHandle,
    mut reader: R,
    engine: &dyn ProtocolEngine,
    settings: &ReadSettings,
    lifecycle: &mut watch::Receiver<TeardownState>,
) {
    let id = handle.id();
    let gate = &handle.shared.gate;
    let mut buf = vec![0u8; settings.buffer_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = cancelled(lifecycle) => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                debug!(conn = %id, "peerwire: peer closed the stream");
                handle.teardown(DisconnectReason::TransportClosed);
                break;
            }
            Ok(n) => {
                debug!(conn = %id, bytes = n, "peerwire: read data from peer");
                // Armed before the feed so a resume issued while the engine
                // is still handling this chunk is not lost.
                gate.arm();
                let failed = match engine.feed_bytes(handle, &buf[..n]) {
                    Ok(true) => {
                        debug!(conn = %id, "peerwire: pausing read at engine's request");
                        false
                    }
                    Ok(false) => {
                        gate.disarm();
                        false
                    }
                    Err(e) => {
                        gate.disarm();
                        warn!(conn = %id, error = %e, "peerwire: engine failed to read event");
                        handle.teardown(DisconnectReason::EngineError);
                        true
                    }
                };
                engine.process_pending_events();
                if failed {
                    break;
                }

                if gate.is_paused() {
                    tokio::select! {
                        biased;
                        _ = cancelled(lifecycle) => break,
                        _ = gate.wait() => {}
                    }
                }
            }
            Err(e) if is_transient(&e) => {
                warn!(
                    conn = %id,
                    error = %e,
                    backoff_ms = settings.backoff.as_millis() as u64,
                    "peerwire: transient read failure, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancelled(lifecycle) => break,
                    _ = tokio::time::sleep(settings.backoff) => {}
                }
            }
            Err(e) => {
                debug!(conn = %id, error = %e, "peerwire: read failed");
                handle.teardown(DisconnectReason::TransportClosed);
                break;
            }
        }
    }
    debug!(conn = %id, "peerwire: read loop stopped");
}

/// After each short write, wait for the socket to drain and hand the
/// engine its chance to send the rest.
async fn write_space_loop(
    handle: SocketHandle,
    engine: Arc<dyn ProtocolEngine>,
    mut start: watch::Receiver<bool>,
    mut lifecycle: watch::Receiver<TeardownState>,
) {
    if !wait_for_start(&mut start, &mut lifecycle).await {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut lifecycle) => break,
            _ = handle.shared.write_space.notified() => {}
        }
        let Some(writer) = handle.current_writer() else {
            break;
        };
        let ready = tokio::select! {
            biased;
            _ = cancelled(&mut lifecycle) => break,
            ready = writer.writable() => ready,
        };
        drop(writer);

        if let Err(e) = ready {
            warn!(conn = %handle.id(), error = %e, "peerwire: socket failed while waiting to write");
            handle.teardown(DisconnectReason::WriteFailed);
            break;
        }
        if handle.shared.write_blocked.swap(false, Ordering::SeqCst) {
            debug!(conn = %handle.id(), "peerwire: socket writable again");
            engine.write_buffer_space_avail(&handle);
        }
    }
}

async fn liveness_loop(
    handle: SocketHandle,
    interval: Duration,
    mut start: watch::Receiver<bool>,
    mut lifecycle: watch::Receiver<TeardownState>,
) {
    if !wait_for_start(&mut start, &mut lifecycle).await {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut lifecycle) => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !handle.transport_connected() {
            info!(conn = %handle.id(), "peerwire: transport no longer connected");
            handle.teardown(DisconnectReason::LivenessLost);
            break;
        }
    }
}
