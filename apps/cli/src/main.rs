//! chatkb CLI: builds a knowledge base from WhatsApp chat exports.
//!
//! Parses exports, drops noise, anonymizes, extracts knowledge items with an
//! LLM, deduplicates them and publishes a single JSON file.

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
