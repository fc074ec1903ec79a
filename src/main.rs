use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use banwatch::config::Config;
use cli::{run_command, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // --debug, then RUST_LOG, then LOG_LEVEL from the config
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.general.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(e) = run_command(cli, config).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
