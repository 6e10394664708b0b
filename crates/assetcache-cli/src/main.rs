//! assetcache - offline-first asset cache for the MailCraft web app.
//!
//! Installs a versioned cache of the application's static assets, keeps
//! it current on version bumps, and serves requests cache-first either one
//! at a time (`fetch`) or through a local reverse proxy (`serve`).

mod cli;
mod commands;
mod logging;
mod proxy;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};
use commands::Runtime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = logging::init_tracing(cli.log_level, cli.log_file.as_deref());
    info!("assetcache {} starting", env!("CARGO_PKG_VERSION"));

    let rt = Runtime::build(&cli)?;

    match &cli.command {
        Commands::Install => commands::install(&rt).await,
        Commands::Activate => commands::activate(&rt).await,
        Commands::Fetch(args) => commands::fetch(&rt, args).await,
        Commands::Status => commands::status(&rt).await,
        Commands::Serve(args) => commands::serve(&rt, args).await,
    }
}
