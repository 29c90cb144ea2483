//! Streamgate CLI - Command-line interface
//!
//! Provides command-line access to the gateway server and cookie store
//! maintenance.

mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "streamgate")]
#[command(about = "A media retrieval gateway")]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    commands::handle_command(cli.command).await?;

    Ok(())
}
