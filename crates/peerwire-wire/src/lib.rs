//! Peerwire: duplex socket adapter for peer-to-peer protocol engines.
//!
//! Bridges TCP connections to a synchronous, byte-oriented protocol engine
//! (handshake, framing and encryption live in the engine). The adapter moves
//! raw bytes in both directions, honors the engine's read backpressure and
//! tears every connection down exactly once.
//!
//! ## Architecture
//!
//! - **Connection / SocketHandle**: One socket, its background loops,
//!   and the serialized send path the engine writes through
//! - **ProtocolEngine**: Trait the engine implements to receive connections
//!   and bytes
//! - **ConnectionRegistry**: Tracks live connections and publishes changes
//! - **PeerNode**: TCP listener and dialer that establishes connections
//! - **DuplexTransport**: The socket capability, implemented for TCP

pub mod connection;
pub mod engine;
pub mod error;
pub mod gate;
pub mod node;
pub mod registry;
pub mod transport;

pub use connection::{Connection, Direction, DisconnectReason, SocketHandle, TeardownState};
pub use engine::{EngineError, ProtocolEngine};
pub use error::WireError;
pub use gate::ReadGate;
pub use node::PeerNode;
pub use registry::{ConnectionRegistry, ConnectionStore, RegistryEvent};
pub use transport::{DuplexTransport, TcpTransport, TransportReader, TransportWriter};
