//! Flint CLI - Main Entry Point
//!
//! Runs the Flint web server and manages its credentials.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod logging;
mod output;
mod prompt;

use commands::{api_key, serve};

/// Flint - web, CLI and API front end for KVM
#[derive(Parser)]
#[command(name = "flint")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (default: ~/.flint/config.json)
    #[arg(long, global = true, env = "FLINT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web server
    Serve(serve::ServeArgs),

    /// Print the API key
    ApiKey,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(flint_common::default_config_path);

    match cli.command {
        Commands::Serve(args) => serve::execute(args, &config_path).await?,
        Commands::ApiKey => api_key::execute(&config_path)?,
        Commands::Version => {
            println!("Flint v{}", flint_common::VERSION);
        }
    }

    Ok(())
}
