//! # SlyNet CLI Application
//!
//! Main entry point for the SlyNet peer. Sets up logging, parses the command
//! line and dispatches to the command handlers in [`slynet::cli`].

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slynet::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slynet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.config_folder() {
        Ok(folder) => match cli.command {
            Commands::Init => cli::init(&folder, cli.key_bits).await,
            Commands::Id => cli::show_id(&folder, cli.key_bits).await,
            Commands::ResetKey => cli::reset_key(&folder, cli.key_bits).await,
            Commands::Trust { ref device_id } => cli::trust_device(&folder, device_id).await,
            Commands::Daemon { allow_pairing } => {
                cli::run_daemon(&folder, cli.key_bits, allow_pairing).await
            }
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{} {}\n{}", "Error:".red().bold(), e.to_string().red(), "Tip: Run with --help for usage information.".yellow());
        std::process::exit(1);
    }
    Ok(())
}
