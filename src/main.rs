//! Whale provenance - trace where a wallet's money came from
//!
//! Walks inbound transfers backwards until it reaches exchanges or bridges,
//! and groups wallets that were funded from the same place.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

// Use the library crate
use whale_provenance::cli::{commands, TraceOverrides};
use whale_provenance::config::Config;

/// Funding provenance tracer and cluster detector
#[derive(Parser)]
#[command(name = "provenance")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "PROVENANCE_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trace the funding sources of an address
    Trace {
        /// Address to start from
        address: String,

        /// Maximum hops to walk back
        #[arg(long)]
        max_hops: Option<u32>,

        /// Ignore transfers below this amount
        #[arg(long)]
        min_amount: Option<f64>,

        /// Only follow this asset (e.g. USDC)
        #[arg(long)]
        asset: Option<String>,

        /// Funders kept per hop
        #[arg(long)]
        max_branch: Option<usize>,

        /// Give up after this many seconds and report what was found
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Find wallets funded by the same source
    Clusters {
        /// Wallet addresses
        wallets: Vec<String>,

        /// File with one wallet per line
        #[arg(long)]
        wallets_file: Option<PathBuf>,

        /// Ignore transfers below this amount
        #[arg(long)]
        min_amount: Option<f64>,

        /// Only count funding from the last N hours
        #[arg(long)]
        lookback_hours: Option<u64>,

        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Classify addresses (exchange, bridge, protocol, wallet)
    Classify {
        /// Addresses to classify
        #[arg(required = true)]
        addresses: Vec<String>,

        /// Write the JSON result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for reports
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("whale_provenance=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_line_number(true)
            .init();
    }

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Trace {
            address,
            max_hops,
            min_amount,
            asset,
            max_branch,
            deadline_secs,
            output,
        } => {
            let overrides = TraceOverrides {
                max_hops,
                min_amount,
                asset,
                max_branch,
                deadline_secs,
            };
            commands::trace(&config, &address, &overrides, output.as_deref()).await
        }
        Commands::Clusters {
            wallets,
            wallets_file,
            min_amount,
            lookback_hours,
            output,
        } => {
            commands::clusters(
                &config,
                wallets,
                wallets_file.as_deref(),
                min_amount,
                lookback_hours,
                output.as_deref(),
            )
            .await
        }
        Commands::Classify { addresses, output } => {
            commands::classify(&config, &addresses, output.as_deref()).await
        }
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
