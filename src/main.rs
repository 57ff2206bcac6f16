// ABOUTME: Command-line entry point for the parley bot
// ABOUTME: Loads config, sets up logging and metrics, then serves the console platform

use anyhow::Result;
use clap::{Parser, Subcommand};
use parley::{config::Config, console::ConsolePlatform, logging, telemetry};
use parley_core::MessagingPlatform;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "parley", version, about = "Chat command dispatcher")]
struct Cli {
    /// Config file to use instead of the default search order
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Talk to the bot from this terminal (default)
    Run,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load_from(cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => {
            let _guard = logging::init(&config.logging, config.log_dir().as_deref())?;
            telemetry::init(&config.metrics)?;
            tracing::info!(
                prefixes = ?config.dispatcher.prefixes(),
                nicknames = ?config.dispatcher.nicknames(),
                "Starting parley"
            );

            let storage = parley::open_storage(&config)?;
            let console: Arc<dyn MessagingPlatform> =
                Arc::new(ConsolePlatform::new(&config.console));
            tokio::select! {
                result = parley::run(&config, storage, vec![console]) => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                }
            }
            Ok(())
        }
    }
}
