use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod orchestrator;
use orchestrator::{Algorithm, HarnessConfig, Orchestrator};

/// Bitcoin fee estimation research harness
#[derive(Parser)]
#[command(name = "fee-harness")]
#[command(about = "Runs fee estimation algorithms against a live node and scores them")]
#[command(version)]
struct Cli {
    /// Bitcoin node RPC address
    #[arg(long, default_value = "127.0.0.1:8332")]
    url: String,

    /// RPC username
    #[arg(short, long, default_value = "bitcoinrpc")]
    user: String,

    /// RPC password
    #[arg(short, long, default_value = "")]
    password: String,

    /// Directory for CSV output
    #[arg(long, default_value = "./output")]
    output_dir: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bucketed block-policy estimator
    Policy,

    /// Run the bin-based rolling estimator
    Bin,

    /// Run the naive percentile estimator
    Naive,

    /// Run the mempool-window estimator
    Mempool,

    /// Score the node's own estimatesmartfee
    Node,

    /// Run every estimation algorithm
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(cli.log_level.parse().context("invalid log level")?),
        )
        .init();

    let algorithms = match cli.command {
        Commands::Policy => vec![Algorithm::Policy],
        Commands::Bin => vec![Algorithm::Bin],
        Commands::Naive => vec![Algorithm::Naive],
        Commands::Mempool => vec![Algorithm::Mempool],
        Commands::Node => vec![Algorithm::Node],
        Commands::All => vec![
            Algorithm::Policy,
            Algorithm::Bin,
            Algorithm::Naive,
            Algorithm::Mempool,
            Algorithm::Node,
        ],
    };

    let config = HarnessConfig {
        rpc_url: cli.url,
        rpc_user: cli.user,
        rpc_password: cli.password,
        output_dir: cli.output_dir,
        algorithms,
    };

    info!("Starting fee estimation harness...");
    info!("RPC url: {}", config.rpc_url);
    info!("Output directory: {:?}", config.output_dir);

    let orchestrator = Orchestrator::new(config).context("Failed to initialize harness")?;
    orchestrator
        .start()
        .await
        .context("Harness execution failed")?;

    info!("Fee estimation harness stopped");
    Ok(())
}
