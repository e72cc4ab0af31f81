//! P2PSync - Peer-to-Peer Operation Replication
//!
//! Runs a replication node: peer server, replication engine and HTTP API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use p2psync::api::HttpServer;
use p2psync::config::P2PSyncConfig;
use p2psync::error::{Error, Result};
use p2psync::executor::open_store;
use p2psync::network::{NetworkClient, NetworkServer};
use p2psync::oplog::OperationLog;
use p2psync::replication::{PeerService, ReplicationEngine};
use p2psync::state::PeerAddress;

/// P2PSync - Peer-to-Peer Operation Replication
#[derive(Parser)]
#[command(name = "p2psync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "p2psync.toml")]
    config: PathBuf,

    /// Log level, overrides the configured one (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Peer to catch up from (host:port), may be repeated.
        /// Replaces the configured bootstrap peers.
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },

    /// Query a running node's status
    Status {
        /// HTTP API address of the node
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "p2psync.toml")]
        output: PathBuf,

        /// Peer port of the new node
        #[arg(long, default_value_t = 7654)]
        port: u16,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bootstrap } => {
            let config = load_config(&cli.config)?;
            init_logging(
                cli.log_level.as_deref().unwrap_or(&config.logging.level),
                &config.logging.format,
            );
            run_start(config, bootstrap).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_status(address).await
        }
        Commands::Init { output, port } => run_init(output, port),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> Result<P2PSyncConfig> {
    P2PSyncConfig::from_file(path).map_err(|e| {
        eprintln!("Failed to load configuration from {:?}: {}", path, e);
        e
    })
}

/// Start the node
async fn run_start(mut config: P2PSyncConfig, bootstrap: Vec<String>) -> Result<()> {
    if !bootstrap.is_empty() {
        config.cluster.bootstrap = bootstrap;
        config.validate()?;
    }

    let local = config.local_address();
    let bootstrap_peers = config.bootstrap_peers()?;
    tracing::info!("Starting p2psync node {}", local);

    let log = match OperationLog::open(config.data_dir(), config.log.clone()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::error!("Failed to open operation log in {:?}: {}", config.data_dir(), e);
            return Err(e);
        }
    };

    let store = match open_store(&config.store, &config.store_path()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open state store: {}", e);
            return Err(e);
        }
    };

    let client = Arc::new(NetworkClient::new(config.connect_timeout(), config.request_timeout()));
    let engine = ReplicationEngine::new(
        local.clone(),
        config.replication_config(),
        log,
        store.clone(),
        client,
    );

    // The peer server must be up before joining so the bootstrap peer can
    // probe us as soon as we register
    let server = NetworkServer::bind(&config.bind_address(), PeerService::new(engine.clone())).await?;
    let server_shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    if let Err(e) = engine.start(&bootstrap_peers).await {
        tracing::error!("Failed to join the network: {}", e);
        engine.stop().await;
        server_shutdown.cancel();
        let _ = server_task.await;
        return Err(e);
    }

    let http_shutdown = server_shutdown.child_token();
    let http_server = HttpServer::new(config.api.clone(), engine.clone(), store);
    let http_task = tokio::spawn(async move { http_server.start(http_shutdown).await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Received shutdown signal");

    engine.stop().await;
    server_shutdown.cancel();

    match server_task.await {
        Ok(Err(e)) => tracing::error!("Peer server error: {}", e),
        Err(e) => tracing::error!("Peer server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    match http_task.await {
        Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("Node {} shut down", local);
    Ok(())
}

/// Query a node's status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            let pretty = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", pretty);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Write a configuration template
fn run_init(output: PathBuf, port: u16) -> Result<()> {
    let config_content = format!(
        r#"# P2PSync Configuration
# Generated configuration file

[node]
host = "127.0.0.1"
port = {port}
# bind_address = "0.0.0.0:{port}"
data_dir = "/var/lib/p2psync/node-{port}"

[log]
fsync = true
compression = false

[cluster]
# Peers to catch up from when joining, tried in order.
# Leave empty to start a new network.
bootstrap = []
# bootstrap = ["node-1.example.com:7654", "node-2.example.com:7654"]
heartbeat_interval_ms = 1000
heartbeat_timeout_ms = 500
failure_threshold = 3
connect_timeout_ms = 2000
request_timeout_ms = 5000

[store]
backend = "sqlite"

[api]
enabled = true
bind_address = "127.0.0.1:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set this node's address and bootstrap peers.");
    println!("Then start with: p2psync --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match P2PSyncConfig::from_file(&config_path) {
        Ok(config) => {
            let bootstrap: Vec<PeerAddress> = config.bootstrap_peers()?;
            println!("✓ Configuration is valid");
            println!("  Address: {}", config.local_address());
            println!("  Bind Address: {}", config.bind_address());
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Store: {:?}", config.store.backend);
            if bootstrap.is_empty() {
                println!("  Bootstrap: none (starts a new network)");
            } else {
                for peer in bootstrap {
                    println!("  Bootstrap: {}", peer);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
