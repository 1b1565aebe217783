// rollstat - command-line entry point
//
// Startup order:
// 1. Parse CLI (config subcommands run before the config file is loaded)
// 2. Load configuration (env > file > defaults); a broken file fails fast
// 3. Initialize tracing (stderr + optional JSON file layer)
// 4. Dispatch the subcommand (default: run the scheduler)

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use rollstat::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::Config { show, reset, path } = command {
        return cli::handle_config(show, reset, path);
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();
    let config = Config::load()?;

    // The guard must be kept alive for the duration of the program to ensure logs flush
    let _file_guard = rollstat::logging::init(&config.logging);
    tracing::debug!(db = %config.db_path.display(), "Configuration loaded");

    cli::dispatch(command, &config).await
}
