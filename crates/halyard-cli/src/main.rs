//! Halyard CLI entry point.

use anyhow::Result;
use clap::Parser;

use halyard_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    halyard_core::init_logging(cli.log_format);
    let config = cli.config();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Migrate => halyard_cli::commands::migrate::execute(&config).await,
            Commands::Session(args) => halyard_cli::commands::session::execute(args, &config).await,
            Commands::Ledger(args) => halyard_cli::commands::ledger::execute(args, &config).await,
            Commands::Token(args) => halyard_cli::commands::token::execute(args, &config).await,
            Commands::Pipeline(args) => {
                halyard_cli::commands::pipeline::execute(args, &config).await
            }
        }
    })
}
