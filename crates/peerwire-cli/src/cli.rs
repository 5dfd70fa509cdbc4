//! Clap CLI definitions for peerwire.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Peerwire: run a TCP node in front of a peer-to-peer protocol engine.
#[derive(Parser)]
#[command(name = "peerwire", version, about)]
pub struct Cli {
    /// Path to config file (defaults to ~/.peerwire/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Listen for peers and echo everything they send until Ctrl+C.
    Listen {
        /// Override the configured listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Dial a peer and echo everything it sends until Ctrl+C.
    Dial {
        /// Address of the remote node.
        addr: SocketAddr,
        /// Hex-encoded 33-byte public key of the remote node.
        peer_id: String,
    },
    /// Load and validate the config file, then print it.
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dial() {
        let peer = "02".repeat(33);
        let cli = Cli::try_parse_from(["peerwire", "dial", "127.0.0.1:9735", &peer]).unwrap();
        match cli.command {
            Commands::Dial { addr, peer_id } => {
                assert_eq!(addr.port(), 9735);
                assert_eq!(peer_id, peer);
            }
            _ => panic!("expected dial"),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_listen_with_global_config() {
        let cli = Cli::try_parse_from([
            "peerwire",
            "listen",
            "--listen",
            "0.0.0.0:19735",
            "--config",
            "/tmp/peerwire.toml",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Listen { listen: Some(addr) } if addr.port() == 19735
        ));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/peerwire.toml")));
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(Cli::try_parse_from(["peerwire", "listen", "--listen", "nowhere"]).is_err());
    }
}
