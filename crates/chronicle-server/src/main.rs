//! Chronicle Server - transaction log replication node
//!
//! Runs as leader, replica or read-only replica according to its
//! configuration file, serving replication over TCP.

use chronicle_server::ChronicleServer;
use chronicle_server::config::ServerConfig;
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Chronicle Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "chronicle-server")]
#[command(about = "Chronicle transaction log replication node", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(long, short = 'c', default_value = "config/chronicle.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // CPU count, minimum 2, maximum 16
    let worker_threads = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 16);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("chronicle-worker")
        .enable_all()
        .build()?;

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chronicle_server=debug,chronicle_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chronicle_server=info,chronicle_core=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::debug!("Configured Tokio runtime: {} worker threads", worker_threads);

    rt.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(
        "Starting Chronicle {} as {:?} on {} (cluster size {})",
        env!("CARGO_PKG_VERSION"),
        config.node.role,
        config.node.bind_addr,
        config.replication.cluster_size
    );

    let (server, events) = ChronicleServer::start(config).await?;
    tracing::info!(
        "Node {} listening on {}",
        server.node().member().instance_id,
        server.local_addr()
    );

    server
        .run(events, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Chronicle stopped");
    Ok(())
}
