//! # ledger-relay
//!
//! Starts the upstream source pool and the client admission guard from a
//! JSON configuration file.
//!
//! ## Usage
//!
//! ```bash
//! # Run until Ctrl-C, logging source status every 30 seconds
//! ledger-relay run --config relay.json
//!
//! # Node already has ledger history: smaller initial download
//! ledger-relay run --config relay.json --has-history --status-interval-secs 10
//!
//! # Validate a configuration file and print the effective settings
//! ledger-relay check --config relay.json
//! ```
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use anyhow::Result;
use argh::FromArgs;
use relay_balancer::LoadBalancer;
use relay_common::{DosGuard, RelayConfig, Sweeper};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(FromArgs)]
/// ledger-relay - resilient access to upstream ledger nodes
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Check(CheckArgs),
}

/// Arguments for running the relay.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// start the relay
struct RunArgs {
    /// path to the JSON configuration file
    #[argh(option, short = 'c')]
    config: String,

    /// the local store already holds ledger history
    ///
    /// Lowers the default initial-download parallelism from 16 to 4 when
    /// `num_markers` is not configured.
    #[argh(switch)]
    has_history: bool,

    /// seconds between source status reports
    #[argh(option, default = "30")]
    status_interval_secs: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// validate a configuration file
struct CheckArgs {
    /// path to the JSON configuration file
    #[argh(option, short = 'c')]
    config: String,
}

fn load_config(path: &str) -> Result<RelayConfig> {
    RelayConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("Invalid configuration {}: {}", path, e))
}

/// Configuration as the relay will apply it, defaults filled in.
fn effective_settings(config: &RelayConfig) -> Result<Value> {
    let sources: Vec<String> = config.etl_sources.iter().map(|s| s.url()).collect();

    Ok(json!({
        "etl_sources": sources,
        "download_ranges": {
            "fresh": config.download_ranges(false),
            "with_history": config.download_ranges(true),
        },
        "dos_guard": serde_json::to_value(&config.dos_guard)?,
        "source_retry": serde_json::to_value(&config.source_retry)?,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check(args) => {
            let config = load_config(&args.config)?;
            println!("{}", serde_json::to_string_pretty(&effective_settings(&config)?)?);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    if args.status_interval_secs == 0 {
        anyhow::bail!("--status-interval-secs must be at least 1");
    }

    let config = load_config(&args.config)?;
    tracing::info!("Loaded configuration from {}", args.config);

    let guard = Arc::new(DosGuard::new(config.dos_guard.clone()));
    let sweeper = Sweeper::new(Arc::clone(&guard), config.dos_guard.sweep_interval()).spawn();
    tracing::info!(
        "DoS guard: max_fetches={} max_connections={} max_requests={} whitelist={}",
        config.dos_guard.max_fetches,
        config.dos_guard.max_connections,
        config.dos_guard.max_requests,
        config.dos_guard.whitelist.len()
    );

    let balancer = LoadBalancer::from_config(&config, args.has_history)?;
    tracing::info!(
        "Load balancer started with {} sources, download ranges {}",
        balancer.source_count(),
        balancer.download_ranges()
    );

    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval_secs));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            _ = status.tick() => {
                let snapshot = serde_json::to_string(&balancer.snapshot())?;
                tracing::info!(
                    clients = guard.tracked_client_count(),
                    "Source status: {}",
                    snapshot
                );
            }
        }
    }

    tracing::info!("Shutting down");
    balancer.stop();
    sweeper.abort();

    Ok(())
}
