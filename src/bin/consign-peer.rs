#![forbid(unsafe_code)]
//! ConsignChain peer: P2P gossip, mining countdown and the REST front door

use clap::Parser;
use colored::*;
use consignchain::api::run_api_server;
use consignchain::config::{read_config_from, DEFAULT_CONFIG_PATH};
use consignchain::crypto::load_or_create_keypair;
use consignchain::discovery::DiscoveryClient;
use consignchain::network::NetworkNode;
use consignchain::peer::{setup_peer_network, Peer, PeerConfig};
use consignchain::persistence::{Database, InMemoryRepository, Repository};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// P2P port (overrides peer.port)
    #[arg(long)]
    port: Option<u16>,
    /// HTTP port (overrides peer.webport)
    #[arg(long)]
    webport: Option<u16>,
    /// Discovery server base URL (overrides discovery.url)
    #[arg(long)]
    discovery: Option<String>,
    /// Database file (overrides database.path)
    #[arg(long)]
    db: Option<String>,
    /// Start from the origin block, discarding stored state
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = read_config_from(&cli.config)?;
    if let Some(port) = cli.port {
        config.peer.port = port;
    }
    if let Some(webport) = cli.webport {
        config.peer.webport = webport;
    }
    if let Some(url) = cli.discovery {
        config.discovery.url = url;
    }
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    config.database.reset_on_start |= cli.reset;
    config.validate()?;

    println!("{}", "📦 ConsignChain peer".bright_cyan().bold());

    if let Some(parent) = Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let repository: Arc<dyn Repository> = match Database::open(&config.database.path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            warn!(path = %config.database.path, error = %e, "falling back to in-memory storage");
            Arc::new(InMemoryRepository::new())
        }
    };

    let keypair = load_or_create_keypair(Path::new(&config.keys.path))?;
    let node = NetworkNode::new();
    let peer = Arc::new(Peer::new(
        repository,
        node.clone(),
        keypair,
        PeerConfig::from_config(&config),
    ));

    let chain = peer.bootstrap(config.database.reset_on_start).await?;
    println!(
        "{}",
        format!(
            "⛓  chain length {} (latest block {})",
            chain.length(),
            chain.latest_block_index()
        )
        .green()
    );

    node.listen(&format!("0.0.0.0:{}", config.peer.port)).await?;

    let discovery = DiscoveryClient::new(
        config.discovery.url.clone(),
        Duration::from_secs(config.discovery.timeout_secs),
    )?;
    match setup_peer_network(
        &peer,
        &node,
        &discovery,
        &config.peer.host,
        config.peer.port,
        config.peer.webport,
    )
    .await
    {
        Ok(connected) => println!("{}", format!("🌐 connected to {} peer(s)", connected).green()),
        Err(e) => {
            // keep serving locally; peers that start later will dial in
            warn!(error = %e, "discovery unavailable");
            println!("{}", "⚠️  discovery server unreachable; running standalone".yellow());
        }
    }

    let _listener = peer.listen(Duration::from_millis(config.peer.poll_interval_ms));
    let _monitor = peer.monitor_transaction_pool(config.mining.monitor_interval());

    info!(
        p2p_port = config.peer.port,
        web_port = config.peer.webport,
        threshold = config.mining.pool_threshold,
        "peer started"
    );
    println!(
        "{}",
        format!("🚀 REST API on http://0.0.0.0:{}", config.peer.webport).bright_green()
    );

    tokio::select! {
        result = run_api_server(peer, config.peer.webport) => {
            if let Err(e) = result {
                error!(error = %e, "api server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            if let Err(e) = discovery.deregister(config.peer.port).await {
                warn!(error = %e, "could not deregister from discovery server");
            }
            println!("{}", "👋 peer stopped".bright_cyan());
        }
    }
    Ok(())
}
