// main.rs
//
// Process bootstrap: flags/env/file -> config -> logging -> server.

use anyhow::Result;
use clap::Parser;
use pixbox::config::{Cli, ProxyConfig};
use pixbox::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ProxyConfig::load(&cli)?;
    telemetry::init_logging(&config.logging())?;
    tracing::debug!(config = ?config, "configuration loaded");
    server::serve(config).await
}
