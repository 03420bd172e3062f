//! Development store binary
//!
//! Run with: cargo run --bin etcd-devstore -- --help

use anyhow::Result;
use clap::Parser;
use etcd_tour::devstore::{run_devstore, DevStoreConfig};

#[derive(Parser, Debug)]
#[command(name = "etcd-devstore")]
#[command(about = "In-memory single-node store speaking the etcd v3 KV and Watch API")]
struct Args {
    /// gRPC listen address
    #[arg(long, default_value = "127.0.0.1:2379")]
    listen_addr: String,

    /// Revisions buffered per watch stream before a slow watcher is cancelled
    #[arg(long, default_value = "1024")]
    watch_buffer: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads for processing requests
    #[arg(long, default_value = "2")]
    worker_threads: usize,
}

async fn run_with_config(args: Args) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = DevStoreConfig {
        listen_addr: args.listen_addr.clone(),
        watch_buffer: args.watch_buffer,
        ..Default::default()
    };

    tracing::info!("=== Development Store Configuration ===");
    tracing::info!("Worker threads: {}", args.worker_threads);
    tracing::info!("Listen address: {}", args.listen_addr);
    tracing::info!("Watch buffer: {} revisions", args.watch_buffer);
    tracing::info!("=======================================");

    run_devstore(config).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    // Build tokio runtime with specified number of worker threads
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}
