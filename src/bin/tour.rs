//! etcd client tour binary
//!
//! Run with: cargo run --bin etcd-tour -- --help

use anyhow::Result;
use clap::{Parser, ValueEnum};
use etcd_tour::client::{ClientConfig, StoreClient};
use etcd_tour::scenarios;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "etcd-tour")]
#[command(about = "Walk through the etcd v3 client API against a live store")]
struct Args {
    /// Store endpoint (host:port or URI)
    #[arg(long, default_value = "localhost:2379")]
    addr: String,

    /// Seconds allowed for establishing the connection
    #[arg(long, default_value = "5")]
    dial_timeout_secs: u64,

    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Context)]
    scenario: Scenario,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Put the sample key
    Insert,
    /// Get the sample key
    Get,
    /// Put then delete a key
    Delete,
    /// Conditional transaction on k1/k2
    Txn,
    /// Watch the sample key while another task changes it
    Watch,
    /// Put with a deadline that cannot be met
    Context,
    /// Every scenario in turn, ending with context
    All,
}

const ALL_SCENARIOS: [Scenario; 6] = [
    Scenario::Insert,
    Scenario::Get,
    Scenario::Delete,
    Scenario::Txn,
    Scenario::Watch,
    Scenario::Context,
];

async fn run_one(client: &StoreClient, scenario: Scenario) -> Result<()> {
    match scenario {
        Scenario::Insert => {
            scenarios::insert(client).await?;
        }
        Scenario::Get => {
            scenarios::get(client).await?;
        }
        Scenario::Delete => {
            scenarios::delete(client).await?;
        }
        Scenario::Txn => {
            scenarios::txn(client).await?;
        }
        Scenario::Watch => {
            let report = scenarios::watch(client).await?;
            tracing::info!("watch saw {} events", report.events.len());
        }
        Scenario::Context => {
            scenarios::context(client).await?;
        }
        Scenario::All => anyhow::bail!("`all` is not a single scenario"),
    }
    Ok(())
}

async fn run_scenario(client: &StoreClient, scenario: Scenario) -> Result<()> {
    if scenario != Scenario::All {
        return run_one(client, scenario).await;
    }
    for scenario in ALL_SCENARIOS {
        tracing::info!("=== {:?} ===", scenario);
        run_one(client, scenario).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ClientConfig {
        endpoints: vec![args.addr.clone()],
        dial_timeout: Duration::from_secs(args.dial_timeout_secs),
    };
    let client = StoreClient::connect(config).await?;

    let result = run_scenario(&client, args.scenario).await;
    client.close();

    if let Err(e) = &result {
        tracing::error!("{:?} scenario failed: {}", args.scenario, e);
    }
    result
}
