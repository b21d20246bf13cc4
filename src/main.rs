use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = cli.mode;
    match cli.command {
        Commands::Encrypt(args) => cli::crypt::encrypt(args, mode).await,
        Commands::Decrypt(args) => cli::crypt::decrypt(args, mode).await,
        Commands::Hash(args) => cli::crypt::hash(args, mode).await,
        Commands::Validate(args) => cli::validate::run(args, mode).await,
        Commands::Audit(args) => cli::audit::run(args, mode).await,
        Commands::Config(args) => cli::config::run(args, mode).await,
        Commands::Resources(args) => cli::resources::run(args, mode).await,
        Commands::Key(args) => cli::key::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
