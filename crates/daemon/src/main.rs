//! nrmesh Daemon
//!
//! Builds the network resources of this node and wires them into their
//! WireGuard meshes.

use anyhow::Context;
use clap::{Parser, Subcommand};
use nrmesh_common::backend::host::HostBackend;
use nrmesh_common::{KeyStore, Network, Networker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod runner;

use config::DaemonConfig;
use runner::Runner;

#[derive(Parser)]
#[command(name = "nrmeshd")]
#[command(about = "nrmesh daemon - network resources and WireGuard mesh for NATed nodes")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nrmesh/config.toml", env = "NRMESH_CONFIG")]
    config: PathBuf,

    /// Node ID, overrides the configuration
    #[arg(short, long, env = "NRMESH_NODE_ID")]
    node_id: Option<String>,

    /// Network definition files, override the configuration
    #[arg(short = 'f', long = "network")]
    networks: Vec<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision and configure the local resource of every network
    Apply,

    /// Print the planned peers and routes without changing anything
    Plan,

    /// Remove the local resource of every network
    Teardown,

    /// Write the effective configuration to the config path
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("nrmesh daemon v{}", nrmesh_common::VERSION);

    let mut config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if !cli.networks.is_empty() {
        config.network_files = cli.networks;
    }

    if let Commands::InitConfig = cli.command {
        config.save(&cli.config)?;
        info!("Configuration written to {}", cli.config.display());
        return Ok(());
    }

    config.validate()?;
    let networks = load_networks(&config.network_files)?;

    let backend = HostBackend::with_paths(&config.backend.ip_path, &config.backend.wg_path);
    let mtu = config.mtu;
    let public_namespace = config.public_namespace.clone();
    let networker = Networker::new(
        config.node_id.clone(),
        Arc::new(backend),
        KeyStore::new(&config.key_dir),
    )
    .with_provisioner(|p| p.with_public_namespace(public_namespace).with_mtu(mtu));

    let runner = Runner::new(Arc::new(networker), config.retry.clone());

    let failed = match cli.command {
        Commands::Apply => {
            tokio::select! {
                failed = runner.apply_all(networks) => failed,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, finishing in-flight steps");
                    return Ok(());
                }
            }
        }
        Commands::Teardown => runner.teardown_all(networks).await,
        Commands::Plan => {
            let mut failed = 0;
            for (name, plan) in runner.plan_all(&networks) {
                match plan {
                    Ok(plan) => println!("{}: {}", name, serde_json::to_string_pretty(&plan)?),
                    Err(e) => {
                        error!(network = %name, "Planning failed: {}", e);
                        failed += 1;
                    }
                }
            }
            failed
        }
        Commands::InitConfig => 0,
    };

    if failed > 0 {
        anyhow::bail!("{} network(s) failed", failed);
    }

    info!("Done");
    Ok(())
}

fn load_networks(paths: &[PathBuf]) -> anyhow::Result<Vec<Network>> {
    if paths.is_empty() {
        anyhow::bail!("no network definitions configured");
    }
    paths.iter().map(|path| load_network(path)).collect()
}

fn load_network(path: &Path) -> anyhow::Result<Network> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let network =
        Network::from_json(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(network)
}
