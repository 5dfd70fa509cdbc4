//! Core types for peerwire.
//!
//! This crate defines the identifiers, configuration and error types shared by
//! the transport adapter and the binary. It contains no I/O beyond reading the
//! configuration file.

pub mod config;
pub mod error;
pub mod id;

pub use config::TransportConfig;
pub use error::{PeerwireError, PeerwireResult};
pub use id::{ConnectionId, PeerId};
