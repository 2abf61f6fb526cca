// ABOUTME: pgclone command-line entry point
// ABOUTME: Parses arguments, initializes logging and hands off to the cli handlers

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    pgclone::logging::init(&args.log_level);
    cli::run(args).await
}
