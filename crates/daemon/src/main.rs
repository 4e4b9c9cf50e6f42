/// onionmesh daemon - onion-routed tunnel node
///
/// This daemon runs a node that:
/// - Relays tunnels built by other nodes
/// - Builds tunnels of its own on request
/// - Exposes a local HTTP API for tunnel control and incoming data

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use onionmesh_common::NodeConfig;
use onionmesh_core::Node;
use onionmesh_daemon::ApiServer;

const DEFAULT_CONFIG: &str = "onionmesh.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");
    let config_path = PathBuf::from(args.get(2).map(String::as_str).unwrap_or(DEFAULT_CONFIG));

    match command {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-v" => {
            println!("onionmesh-daemon v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "init" => init_config(&config_path),
        "run" => run_node(&config_path).await,
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Write a default configuration file
fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    NodeConfig::default()
        .to_file(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn load_config(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        return NodeConfig::from_file(path).with_context(|| format!("loading {}", path.display()));
    }
    Ok(NodeConfig::default())
}

/// Run the node and its control API until Ctrl+C
async fn run_node(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(config.verbose);

    info!("Starting onionmesh-daemon v{}", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        info!("No configuration at {:?}, using defaults", config_path);
    }
    let node = Arc::new(Node::from_config(&config).await?);
    info!(
        "Node {} listening on {} with {} known peers",
        node.host_key().public_hex(),
        node.local_addr(),
        config.peers.len()
    );

    let api_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.api_port));
    let api = ApiServer::new(api_addr, node.clone());
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.start().await {
            warn!("API server error: {}", e);
        }
    });

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    api_task.abort();
    node.shutdown().await;

    info!("Node stopped");
    Ok(())
}

fn print_help() {
    println!("onionmesh-daemon - onion-routed tunnel node");
    println!();
    println!("USAGE:");
    println!("    onionmesh-daemon [COMMAND] [CONFIG]");
    println!();
    println!("COMMANDS:");
    println!("    run         Run the node (default)");
    println!("    init        Write a default configuration file");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("CONFIG defaults to ./{}", DEFAULT_CONFIG);
    println!();
    println!("API (127.0.0.1:<api_port>):");
    println!("    GET    /health");
    println!("    GET    /api/status");
    println!("    GET    /api/tunnels");
    println!("    POST   /api/tunnels            {{\"address\", \"port\", \"public_key\"}}");
    println!("    DELETE /api/tunnels/<id>");
    println!("    POST   /api/tunnels/<id>/data  {{\"data\": \"<hex>\"}}");
    println!("    POST   /api/cover              {{\"size\": <bytes>}}");
    println!("    GET    /api/events");
}
