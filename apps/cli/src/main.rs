//! storyforge CLI: resumable illustration and translation runs over books.
//!
//! Imports book trees, splits them into chunks, and drives generation
//! runs that can be interrupted and resumed without redoing finished work.

mod commands;
mod progress;

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
