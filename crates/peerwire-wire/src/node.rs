//! TCP node: listens for peers and dials out.
//!
//! The node binds a listener, accepts sockets in a background loop and
//! establishes each of them as an inbound [`Connection`] in its own task.
//! Outbound connections are dialed with [`PeerNode::connect`]. All live
//! connections are tracked in the node's [`ConnectionRegistry`].

use crate::connection::Connection;
use crate::engine::ProtocolEngine;
use crate::error::WireError;
use crate::registry::{ConnectionRegistry, ConnectionStore};
use crate::transport::TcpTransport;
use chrono::{DateTime, Utc};
use peerwire_types::{PeerId, TransportConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The local network node.
pub struct PeerNode {
    config: TransportConfig,
    engine: Arc<dyn ProtocolEngine>,
    registry: ConnectionRegistry,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    /// Connections accepted or dialed but not yet published.
    establishing: Arc<AtomicUsize>,
}

/// A connection slot held while a connection is being established.
/// Released on drop.
struct SlotReservation(Arc<AtomicUsize>);

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PeerNode {
    /// Validate `config`, bind the listener and start accepting.
    ///
    /// Returns the node and the accept loop's task, which finishes after
    /// [`shutdown`](Self::shutdown).
    pub async fn start(
        config: TransportConfig,
        engine: Arc<dyn ProtocolEngine>,
        registry: ConnectionRegistry,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            "peerwire: listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            engine,
            registry,
            local_addr,
            started_at: Utc::now(),
            shutdown_tx,
            establishing: Arc::new(AtomicUsize::new(0)),
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            node_clone.accept_loop(listener, shutdown_rx).await;
        });

        Ok((node, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Seconds since the node started listening.
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Dial `addr` and establish an outbound connection to `peer`.
    pub async fn connect(&self, addr: SocketAddr, peer: PeerId) -> Result<Connection, WireError> {
        if self.is_shutting_down() {
            return Err(WireError::ClosedDuringSetup);
        }
        let _slot = self.reserve_slot()?;

        info!(addr = %addr, peer_id = %peer, "peerwire: connecting to peer");
        let timeout = self.config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                warn!(addr = %addr, "peerwire: connect timed out");
                return Err(WireError::ConnectTimeout {
                    addr,
                    secs: timeout.as_secs(),
                });
            }
        };

        let transport = TcpTransport::new(stream);
        transport.configure(&self.config)?;
        let conn = Connection::outbound(
            transport,
            &peer,
            Arc::clone(&self.engine),
            self.store(),
            &self.config,
        )?;
        // Shutdown may have snapshotted the registry while we were dialing.
        if self.is_shutting_down() {
            conn.disconnect();
            return Err(WireError::ClosedDuringSetup);
        }
        Ok(conn)
    }

    /// Stop accepting and disconnect every live connection.
    ///
    /// Returns the number of connections closed. Calling it again closes
    /// nothing further.
    pub fn shutdown(&self) -> usize {
        if self.shutdown_tx.send_replace(true) {
            return 0;
        }
        let closed = self.registry.disconnect_all();
        info!(
            addr = %self.local_addr,
            closed,
            "peerwire: node shut down"
        );
        closed
    }

    fn store(&self) -> Arc<dyn ConnectionStore> {
        Arc::new(self.registry.clone())
    }

    /// Claim a connection slot, counting live connections and the ones
    /// still being established.
    fn reserve_slot(&self) -> Result<SlotReservation, WireError> {
        let pending = self.establishing.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = SlotReservation(Arc::clone(&self.establishing));
        let max = self.config.max_connections;
        if max > 0 && self.registry.len() + pending > max {
            return Err(WireError::AtCapacity { max });
        }
        Ok(slot)
    }

    /// Internal accept loop: runs in a spawned task.
    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "peerwire: accepted socket");
                    let slot = match self.reserve_slot() {
                        Ok(slot) => slot,
                        Err(e) => {
                            warn!(peer = %addr, error = %e, "peerwire: refusing connection");
                            continue;
                        }
                    };
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        let established = node.establish_inbound(stream);
                        drop(slot);
                        if let Err(e) = established {
                            debug!(
                                peer = %addr,
                                error = %e,
                                "peerwire: inbound connection not established"
                            );
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "peerwire: accept error");
                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!(addr = %self.local_addr, "peerwire: accept loop stopped");
    }

    fn establish_inbound(&self, stream: TcpStream) -> Result<Connection, WireError> {
        let transport = TcpTransport::new(stream);
        transport.configure(&self.config)?;
        let conn = Connection::inbound(
            transport,
            Arc::clone(&self.engine),
            self.store(),
            &self.config,
        )?;
        // Shutdown may have snapshotted the registry before this connection
        // was published.
        if self.is_shutting_down() {
            conn.disconnect();
        }
        Ok(conn)
    }
}

impl std::fmt::Debug for PeerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNode")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.registry.len())
            .field("establishing", &self.establishing.load(Ordering::SeqCst))
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{DisconnectReason, SocketHandle};
    use crate::engine::EngineError;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Mutex, OnceLock};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Records inbound chunks; optionally rejects or sends a greeting.
    #[derive(Default)]
    struct TestEngine {
        reject: AtomicBool,
        /// Stall registration, as an engine doing setup work would.
        slow_registration: AtomicBool,
        greeting: Vec<u8>,
        received: Mutex<Vec<u8>>,
        outbound_peers: Mutex<Vec<PeerId>>,
    }

    impl ProtocolEngine for TestEngine {
        fn register_inbound(
            &self,
            _handle: SocketHandle,
            _peer_addr: Option<SocketAddr>,
        ) -> Result<(), EngineError> {
            if self.slow_registration.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(150));
            }
            if self.reject.load(Ordering::SeqCst) {
                return Err(EngineError::new("closed for business"));
            }
            Ok(())
        }

        fn register_outbound(
            &self,
            peer: &PeerId,
            _handle: SocketHandle,
            _peer_addr: SocketAddr,
        ) -> Result<Vec<u8>, EngineError> {
            self.outbound_peers.lock().unwrap().push(*peer);
            Ok(self.greeting.clone())
        }

        fn feed_bytes(&self, _handle: &SocketHandle, data: &[u8]) -> Result<bool, EngineError> {
            self.received.lock().unwrap().extend_from_slice(data);
            Ok(false)
        }

        fn process_pending_events(&self) {}
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    async fn wait_for_len(registry: &ConnectionRegistry, len: usize) {
        for _ in 0..200 {
            if registry.len() == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {len} connections");
    }

    #[tokio::test]
    async fn test_node_start_and_accept() {
        let engine = Arc::new(TestEngine::default());
        let registry = ConnectionRegistry::new();
        let (node, _task) = PeerNode::start(test_config(), engine.clone(), registry.clone())
            .await
            .unwrap();
        assert_ne!(node.local_addr().port(), 0);

        let mut client = TcpStream::connect(node.local_addr()).await.unwrap();
        wait_for_len(&registry, 1).await;

        client.write_all(b"hello node").await.unwrap();
        for _ in 0..200 {
            if engine.received.lock().unwrap().as_slice() == b"hello node" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.received.lock().unwrap().as_slice(), b"hello node");
    }

    #[tokio::test]
    async fn test_rejected_inbound_is_closed() {
        let engine = Arc::new(TestEngine::default());
        engine.reject.store(true, Ordering::SeqCst);
        let registry = ConnectionRegistry::new();
        let (node, _task) = PeerNode::start(test_config(), engine, registry.clone())
            .await
            .unwrap();

        let mut client = TcpStream::connect(node.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("rejected socket should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connect_sends_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let engine = Arc::new(TestEngine {
            greeting: b"hi".to_vec(),
            ..Default::default()
        });
        let (node, _task) =
            PeerNode::start(test_config(), engine.clone(), ConnectionRegistry::new())
                .await
                .unwrap();

        let peer = PeerId::from_bytes([3u8; 33]);
        let (conn, accepted) = tokio::join!(node.connect(remote, peer), listener.accept());
        let conn = conn.unwrap();
        let (mut server_side, _) = accepted.unwrap();

        let mut buf = [0u8; 2];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert!(node.registry().contains(&conn.id()));
        assert_eq!(engine.outbound_peers.lock().unwrap().as_slice(), &[peer]);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (node, _task) = PeerNode::start(
            test_config(),
            Arc::new(TestEngine::default()),
            ConnectionRegistry::new(),
        )
        .await
        .unwrap();

        let err = node
            .connect(addr, PeerId::from_bytes([3u8; 33]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
        assert!(node.registry().is_empty());
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let config = TransportConfig {
            max_connections: 1,
            ..test_config()
        };
        let registry = ConnectionRegistry::new();
        let (node, _task) =
            PeerNode::start(config, Arc::new(TestEngine::default()), registry.clone())
                .await
                .unwrap();

        let _first = TcpStream::connect(node.local_addr()).await.unwrap();
        wait_for_len(&registry, 1).await;

        let mut second = TcpStream::connect(node.local_addr()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("refused socket should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(registry.len(), 1);

        let err = node
            .connect(node.local_addr(), PeerId::from_bytes([3u8; 33]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::AtCapacity { max: 1 }));
    }

    #[tokio::test]
    async fn test_reserved_slots_count_against_capacity() {
        let config = TransportConfig {
            max_connections: 2,
            ..test_config()
        };
        let (node, _task) = PeerNode::start(
            config,
            Arc::new(TestEngine::default()),
            ConnectionRegistry::new(),
        )
        .await
        .unwrap();

        let first = node.reserve_slot().unwrap();
        let _second = node.reserve_slot().unwrap();
        assert!(matches!(
            node.reserve_slot(),
            Err(WireError::AtCapacity { max: 2 })
        ));
        // A refused attempt gives its slot back.
        assert_eq!(node.establishing.load(Ordering::SeqCst), 2);

        drop(first);
        assert!(node.reserve_slot().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_holds_while_inbound_is_establishing() {
        let config = TransportConfig {
            max_connections: 2,
            ..test_config()
        };
        let engine = Arc::new(TestEngine::default());
        engine.slow_registration.store(true, Ordering::SeqCst);
        let registry = ConnectionRegistry::new();
        let (node, _task) = PeerNode::start(config, engine, registry.clone())
            .await
            .unwrap();

        // All four arrive while the first ones are still registering.
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(TcpStream::connect(node.local_addr()).await.unwrap());
        }

        wait_for_len(&registry, 2).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.len(), 2);
        assert_eq!(node.establishing.load(Ordering::SeqCst), 0);
    }

    /// Engine that shuts its own node down while a dial is registering.
    #[derive(Default)]
    struct ShutdownOnDialEngine {
        node: OnceLock<Arc<PeerNode>>,
    }

    impl ProtocolEngine for ShutdownOnDialEngine {
        fn register_inbound(
            &self,
            _handle: SocketHandle,
            _peer_addr: Option<SocketAddr>,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn register_outbound(
            &self,
            _peer: &PeerId,
            _handle: SocketHandle,
            _peer_addr: SocketAddr,
        ) -> Result<Vec<u8>, EngineError> {
            if let Some(node) = self.node.get() {
                node.shutdown();
            }
            Ok(Vec::new())
        }

        fn feed_bytes(&self, _handle: &SocketHandle, _data: &[u8]) -> Result<bool, EngineError> {
            Ok(false)
        }

        fn process_pending_events(&self) {}
    }

    #[tokio::test]
    async fn test_shutdown_during_dial_does_not_leak_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let engine = Arc::new(ShutdownOnDialEngine::default());
        let registry = ConnectionRegistry::new();
        let (node, _task) = PeerNode::start(test_config(), engine.clone(), registry.clone())
            .await
            .unwrap();
        let _ = engine.node.set(Arc::clone(&node));

        let peer = PeerId::from_bytes([3u8; 33]);
        let (conn, accepted) = tokio::join!(node.connect(remote, peer), listener.accept());
        assert!(matches!(conn, Err(WireError::ClosedDuringSetup)));
        assert!(node.is_shutting_down());
        assert!(registry.is_empty());

        let (mut server_side, _) = accepted.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), server_side.read(&mut buf))
            .await
            .expect("dialed socket should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_and_disconnects() {
        let registry = ConnectionRegistry::new();
        let (node, task) = PeerNode::start(
            test_config(),
            Arc::new(TestEngine::default()),
            registry.clone(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(node.local_addr()).await.unwrap();
        wait_for_len(&registry, 1).await;
        let handle = registry.handles().remove(0);

        assert_eq!(node.shutdown(), 1);
        assert_eq!(node.shutdown(), 0);
        assert!(node.is_shutting_down());
        assert!(registry.is_empty());
        assert_eq!(handle.disconnect_reason(), Some(DisconnectReason::Local));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("accept loop should stop")
            .unwrap();

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let err = node
            .connect(node.local_addr(), PeerId::from_bytes([3u8; 33]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::ClosedDuringSetup));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = TransportConfig {
            read_buffer_size: 0,
            ..test_config()
        };
        let err = PeerNode::start(
            config,
            Arc::new(TestEngine::default()),
            ConnectionRegistry::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WireError::Config(_)));
    }
}
