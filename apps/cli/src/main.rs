//! xaio CLI: staged, resumable processing of harvested documents.
//!
//! Reads ready rows from the queue, runs each configured stage that is
//! missing or stale, and records progress back into the queue.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
