//! QuakeGuard CLI Entry Point

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quakeguard_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => quakeguard_cli::simulate::execute(args).await?,
        Commands::Wave(args) => quakeguard_cli::wave::execute(args)?,
        Commands::Config(cmd) => quakeguard_cli::config::execute(cmd)?,
        Commands::Version => {
            println!("quakeguard {}", env!("CARGO_PKG_VERSION"));
            println!("pipeline version: {}", quakeguard_eew::VERSION);
        }
    }

    Ok(())
}
