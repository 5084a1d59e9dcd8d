//! Argus CLI - Main Entry Point
//!
//! Command-line interface for running visual test builds: capture DOM
//! snapshots through a real browser, discover the assets each page
//! needs, and upload everything to the Argus build service.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{finalize, run};

/// Argus CLI - visual testing build runner
#[derive(Parser)]
#[command(name = "argus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "argus.toml", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build from a snapshot manifest
    Run(run::RunArgs),

    /// Finalize every shard of a parallel build
    Finalize(finalize::FinalizeArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let outcome = run::execute(args, &cli.config).await?;
            if outcome != argus_core::BuildOutcome::Success {
                std::process::exit(1);
            }
        }
        Commands::Finalize(args) => finalize::execute(args, &cli.config).await?,
        Commands::Version => {
            println!("Argus CLI v{}", argus_core::VERSION);
        }
    }

    Ok(())
}
