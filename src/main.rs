//! Settlement service CLI
//!
//! Runs the settlement API or inspects persisted engine state.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use utxo_settlement::cli::{self, AppState};

#[derive(Parser)]
#[command(name = "settlement")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "UTXO lifecycle and settlement detection for observed wallets", long_about = None)]
struct Cli {
    /// JSON config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API and background detectors
    Serve {
        /// Chain fixture JSON to seed the in-memory chain
        #[arg(short, long)]
        fixture: Option<PathBuf>,

        /// API port, overrides the config file
        #[arg(short, long)]
        port: Option<u16>,

        /// Mine a fixture block every N seconds
        #[arg(short, long)]
        block_interval: Option<u64>,
    },

    /// Estimate the fee for a transaction shape
    Fee {
        #[arg(short, long, default_value = "1")]
        inputs: usize,

        #[arg(short, long, default_value = "2")]
        outputs: usize,

        /// Fee rate per byte, defaults to the configured rate
        #[arg(short, long)]
        rate: Option<u64>,
    },

    /// Print the validated configuration
    Config,

    /// Output ledger operations
    Ledger {
        #[command(subcommand)]
        action: LedgerCommands,
    },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Show broadcasted and spent output records
    Show,
    /// Expire stale records now
    Sweep,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Fee {
            inputs,
            outputs,
            rate,
        } => cli::cmd_fee(config, inputs, outputs, rate),

        Commands::Config => cli::cmd_config(config),

        Commands::Serve {
            fixture,
            port,
            block_interval,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_serve(
                config,
                cli.data_dir,
                fixture.as_deref(),
                port,
                block_interval,
            ))
        }

        Commands::Ledger { action } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let state = AppState::new(config, cli.data_dir).await?;
                match action {
                    LedgerCommands::Show => cli::cmd_ledger_show(&state).await,
                    LedgerCommands::Sweep => cli::cmd_ledger_sweep(&state).await,
                }
            })
        }
    }
}
