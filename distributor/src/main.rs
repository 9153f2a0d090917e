use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airdrop_distributor::{config::DistributorConfig, AirdropDistributor};

#[derive(Parser)]
#[command(name = "airdrop-distributor")]
#[command(about = "Batched merkle-proof airdrop reward distribution")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/distributor.toml")]
    config: String,

    /// Database URL
    #[arg(long)]
    database_url: Option<String>,

    /// RPC endpoint
    #[arg(long)]
    rpc_url: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run cycles on the configured interval until interrupted
    Run,
    /// Run a single cycle and print its report as JSON
    Once,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("airdrop_distributor={},airdrop_common={}", args.log_level, args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting airdrop distributor v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if Path::new(&args.config).exists() {
        DistributorConfig::load(&args.config)?
    } else {
        info!("Configuration file not found, using default configuration");
        DistributorConfig::default()
    };

    if let Some(database_url) = args.database_url {
        config.database.url = database_url;
    }
    if let Some(rpc_url) = args.rpc_url {
        config.chain.rpc_url = rpc_url;
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Database backend: {}", config.database.backend);
    info!("RPC endpoint: {}", config.chain.rpc_url);
    info!("Registry contract: {}", config.chain.contract_address);

    let distributor = AirdropDistributor::new(config).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Once => {
            let report = distributor.trigger_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run => {
            distributor.start().await?;

            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");

            distributor.stop().await?;
            info!("Airdrop distributor stopped gracefully");
        }
    }

    Ok(())
}
