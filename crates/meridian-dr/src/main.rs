#![warn(missing_docs)]

//! `meridian-dr` binary.

use anyhow::Result;
use clap::Parser;
use meridian_dr::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "meridian-dr starting");
    cli.run().await
}
