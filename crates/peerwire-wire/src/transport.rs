//! Duplex transport capability and its TCP implementation.
//!
//! A [`DuplexTransport`] is split once, at connection construction, into a
//! reader owned exclusively by the read loop and a writer shared by every
//! caller of the send path. Reads and writes never contend with each other.

use async_trait::async_trait;
use peerwire_types::TransportConfig;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Read side of a transport.
#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Read at least one byte into `buf`. `Ok(0)` means the peer closed the
    /// stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a transport, plus connectivity status and close.
#[async_trait]
pub trait TransportWriter: Send + Sync + 'static {
    /// Write as much of `data` as fits without blocking.
    ///
    /// Returns `ErrorKind::WouldBlock` when nothing could be written.
    fn try_write(&self, data: &[u8]) -> io::Result<usize>;

    /// Wait until the transport can take more bytes after a short write.
    async fn writable(&self) -> io::Result<()>;

    /// Whether the underlying connection still looks alive.
    fn is_connected(&self) -> bool;

    /// Close the connection in both directions. Called at most once.
    fn close(&self);
}

/// A bidirectional byte stream the adapter can own.
pub trait DuplexTransport: Send + 'static {
    type Reader: TransportReader;
    type Writer: TransportWriter;

    /// Remote address, if the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Split into independently owned read and write halves.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Whether a read error is a stream boundary condition worth retrying
/// rather than a sign the connection is gone.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// [`DuplexTransport`] over a tokio TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self { stream, peer_addr }
    }

    /// Apply the socket options from `config` (nodelay, keepalive).
    pub fn configure(&self, config: &TransportConfig) -> io::Result<()> {
        self.stream.set_nodelay(config.tcp_nodelay)?;
        if let Some(idle) = config.keepalive() {
            let keepalive = TcpKeepalive::new().with_time(idle);
            SockRef::from(&self.stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

impl DuplexTransport for TcpTransport {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn into_split(self) -> (TcpReader, TcpWriter) {
        let connected = Arc::new(AtomicBool::new(true));
        let (read_half, write_half) = self.stream.into_split();
        (
            TcpReader {
                half: read_half,
                connected: Arc::clone(&connected),
            },
            TcpWriter {
                half: write_half,
                connected,
            },
        )
    }
}

/// Read half of a [`TcpTransport`].
pub struct TcpReader {
    half: OwnedReadHalf,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportReader for TcpReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.half.read(buf).await {
            Ok(0) => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                if !is_transient(&e) {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }
}

/// Write half of a [`TcpTransport`].
pub struct TcpWriter {
    half: OwnedWriteHalf,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportWriter for TcpWriter {
    fn try_write(&self, data: &[u8]) -> io::Result<usize> {
        match self.half.try_write(data) {
            Ok(n) => Ok(n),
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    async fn writable(&self) -> io::Result<()> {
        let stream: &TcpStream = self.half.as_ref();
        stream.writable().await
    }

    fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        // A pending socket error or a vanished peer address means the
        // connection died without the read side noticing yet.
        let stream: &TcpStream = self.half.as_ref();
        match SockRef::from(stream).take_error() {
            Ok(None) => {}
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                return false;
            }
        }
        if stream.peer_addr().is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let stream: &TcpStream = self.half.as_ref();
        // NotConnected here just means the peer got there first.
        let _ = SockRef::from(stream).shutdown(Shutdown::Both);
    }
}
