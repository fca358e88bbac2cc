//! Ledger synchronization daemon
//!
//! Follows an Ethereum-compatible node feed, tracks transaction lifecycles,
//! reconciles token and collectible balances, and dispatches notifications
//! for registered clients.

use anyhow::{Context, Result};
use clap::Parser;
use ledgersync::config::EngineConfig;
use ledgersync::dispatcher::{
    run_delivery_worker, NotificationTransport, OutboundNotification, RetryPolicy,
};
use ledgersync::rpc::FeedClient;
use ledgersync::store::RocksLedgerStore;
use ledgersync::sync::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ledger synchronization daemon
#[derive(Parser)]
#[command(name = "syncd")]
#[command(about = "Follow a chain feed and maintain wallet ledger state")]
struct Args {
    /// RPC endpoint URL of the node feed
    #[arg(short, long, default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Path to the engine config file (JSON); defaults apply if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the RocksDB database directory
    #[arg(short, long, default_value = "./ledger_db")]
    db_path: PathBuf,
}

/// Stand-in transport that logs deliveries. Real push backends (APNs, GCM,
/// web-push) are wired in by the embedding service.
struct LogTransport;

impl NotificationTransport for LogTransport {
    fn deliver(&self, notification: &OutboundNotification) -> Result<()> {
        info!(
            "notify [{}/{}] {:?}: {}",
            notification.service,
            notification.registration_id,
            notification.eth_address,
            notification.payload
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting ledger synchronization daemon");
    info!("RPC URL: {}", args.rpc_url);
    info!("Database: {:?}", args.db_path);

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => EngineConfig::default(),
    };

    let store = Arc::new(
        RocksLedgerStore::open(&args.db_path)
            .with_context(|| format!("Failed to open database at {:?}", args.db_path))?,
    );

    let feed = FeedClient::new(args.rpc_url);
    let (mut engine, outbound) = SyncEngine::new(store.clone(), feed, config)?;

    engine
        .initialize()
        .await
        .context("Failed to initialize engine")?;

    let worker = tokio::spawn(run_delivery_worker(
        store,
        outbound,
        LogTransport,
        RetryPolicy::default(),
    ));

    tokio::select! {
        result = engine.run() => {
            result.context("Engine error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    worker.abort();
    info!("Daemon stopped");
    Ok(())
}
