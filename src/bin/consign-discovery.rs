#![forbid(unsafe_code)]
//! ConsignChain discovery server: keeps the list of active peers

use clap::Parser;
use colored::*;
use consignchain::config::{load_config_from, DEFAULT_CONFIG_PATH};
use consignchain::discovery::{run_discovery_server, DiscoveryRegistry};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// Listening port (overrides discovery.port)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = load_config_from(&cli.config)?;
    let port = cli.port.unwrap_or(config.discovery.port);

    println!(
        "{}",
        format!("🔎 ConsignChain discovery server on port {}", port)
            .bright_cyan()
            .bold()
    );

    run_discovery_server(Arc::new(DiscoveryRegistry::new()), port).await
}
