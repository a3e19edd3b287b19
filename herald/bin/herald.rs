#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use herald::config;

/// Durable email delivery engine
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(about = "Queue and deliver email through SMTP relays", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    ///
    /// Defaults to $HERALD_CONFIG, then ./herald.config.ron, then
    /// /etc/herald/herald.config.ron
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = config::find_config_file(cli.config.as_deref())?;
    let herald = config::load(&config_path)?;

    herald.run().await
}
