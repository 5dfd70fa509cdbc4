//! Shared error types for peerwire.

use thiserror::Error;

/// Top-level error type for configuration and identifier handling.
#[derive(Error, Debug)]
pub enum PeerwireError {
    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A peer identity string was malformed.
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with PeerwireError.
pub type PeerwireResult<T> = Result<T, PeerwireError>;
