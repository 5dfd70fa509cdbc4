//! Peerwire CLI: run a node with the echo engine.
//!
//! `listen` accepts peers, `dial` connects to one; both run until Ctrl+C and
//! then shut the node down. `check-config` validates the config file.

mod cli;
mod echo;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use echo::EchoEngine;
use peerwire_types::config::{default_config_path, load_config, try_load_config};
use peerwire_types::{PeerId, TransportConfig};
use peerwire_wire::{ConnectionRegistry, PeerNode};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let result = match cli.command {
        Commands::Listen { listen } => run_node(cli.config.as_deref(), listen, None),
        Commands::Dial { addr, peer_id } => match peer_id.parse::<PeerId>() {
            Ok(peer) => run_node(cli.config.as_deref(), None, Some((addr, peer))),
            Err(e) => Err(anyhow::Error::new(e).context("invalid peer id")),
        },
        Commands::CheckConfig => cmd_check_config(cli.config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run_node(
    config_path: Option<&Path>,
    listen: Option<SocketAddr>,
    dial: Option<(SocketAddr, PeerId)>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    if let Some(addr) = listen {
        config.listen_addr = addr;
    } else if dial.is_some() {
        // Dialing only needs an ephemeral listener.
        config.listen_addr.set_port(0);
    }

    let rt = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    rt.block_on(async move {
        let registry = ConnectionRegistry::new();
        let (node, accept_task) = PeerNode::start(config, Arc::new(EchoEngine::new()), registry)
            .await
            .context("failed to start node")?;

        if let Some((addr, peer)) = dial {
            let conn = node
                .connect(addr, peer)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            info!(conn = %conn.id(), "Connected to {addr}");
        }

        info!("Running on {}; press Ctrl+C to stop", node.local_addr());
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;

        let closed = node.shutdown();
        info!(closed, "Shutting down");
        let _ = accept_task.await;
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_check_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let config = if path.exists() {
        try_load_config(&path).with_context(|| format!("invalid config {}", path.display()))?
    } else {
        println!("{} not found, using defaults", path.display());
        TransportConfig::default()
    };

    println!("{config:#?}");
    println!("Config OK");
    Ok(())
}
