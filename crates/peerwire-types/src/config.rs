//! Transport configuration, loaded from `~/.peerwire/config.toml` with defaults.

use crate::error::{PeerwireError, PeerwireResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default read buffer capacity (4 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default backoff after a transient read failure.
pub const DEFAULT_READ_BACKOFF_MS: u64 = 1000;

/// Default liveness poll interval.
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 1000;

/// Default outbound dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Configuration for the transport adapter and the TCP node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Capacity of the read loop buffer.
    pub read_buffer_size: usize,
    /// Backoff after a transient read error, in milliseconds.
    pub read_backoff_ms: u64,
    /// Interval between liveness checks, in milliseconds.
    pub liveness_interval_ms: u64,
    /// Timeout for outbound dials, in seconds.
    pub connect_timeout_secs: u64,
    /// Disable Nagle's algorithm on accepted and dialed sockets.
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time in seconds. `None` leaves the OS default.
    pub keepalive_secs: Option<u64>,
    /// Maximum number of live connections. 0 means unlimited.
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9735)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_backoff_ms: DEFAULT_READ_BACKOFF_MS,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL_MS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            tcp_nodelay: true,
            keepalive_secs: None,
            max_connections: 0,
        }
    }
}

impl TransportConfig {
    /// Backoff after a transient read error.
    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    /// Liveness poll interval.
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Outbound dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// TCP keepalive idle time, if enabled.
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs.map(Duration::from_secs)
    }

    /// Reject settings that would stall or spin the connection loops.
    pub fn validate(&self) -> PeerwireResult<()> {
        if self.read_buffer_size == 0 {
            return Err(PeerwireError::Config(
                "read_buffer_size must be at least 1".into(),
            ));
        }
        if self.liveness_interval_ms == 0 {
            return Err(PeerwireError::Config(
                "liveness_interval_ms must be greater than 0".into(),
            ));
        }
        if self.read_backoff_ms == 0 {
            return Err(PeerwireError::Config(
                "read_backoff_ms must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(PeerwireError::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.keepalive_secs == Some(0) {
            return Err(PeerwireError::Config(
                "keepalive_secs must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Read and validate a configuration file, surfacing every failure.
pub fn try_load_config(path: &Path) -> PeerwireResult<TransportConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TransportConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Load transport configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is logged and replaced by
/// [`TransportConfig::default`].
pub fn load_config(path: Option<&Path>) -> TransportConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return TransportConfig::default();
    }

    match try_load_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            TransportConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    peerwire_home().join("config.toml")
}

/// Get the default peerwire home directory.
pub fn peerwire_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".peerwire")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.read_backoff(), Duration::from_secs(1));
        assert_eq!(config.liveness_interval(), Duration::from_secs(1));
        assert!(config.tcp_nodelay);
        assert!(config.keepalive().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "listen_addr = \"0.0.0.0:19735\"").unwrap();
        writeln!(f, "keepalive_secs = 30").unwrap();
        drop(f);

        let config = load_config(Some(&path));
        assert_eq!(config.listen_addr, "0.0.0.0:19735".parse().unwrap());
        assert_eq!(config.keepalive(), Some(Duration::from_secs(30)));
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "read_buffer_size = 0").unwrap();
        drop(f);

        let err = try_load_config(&path).unwrap_err();
        assert!(matches!(err, PeerwireError::Config(_)));

        let config = load_config(Some(&path));
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen_addr = [").unwrap();

        let err = try_load_config(&path).unwrap_err();
        assert!(matches!(err, PeerwireError::ConfigParse(_)));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = TransportConfig {
            liveness_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TransportConfig {
            keepalive_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = TransportConfig {
            max_connections: 8,
            keepalive_secs: Some(60),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        let back: TransportConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, back);
    }
}
