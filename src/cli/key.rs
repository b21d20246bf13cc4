//! CLI subcommand: `warden key`

use anyhow::Result;
use clap::{Args, Subcommand};
use warden::config::Config;
use warden::security::{ensure_master_key_file, read_master_key_file};

#[derive(Args)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub command: KeyCommands,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate the master key file
    Init {
        /// Confirm that the key must be backed up: values encrypted under it
        /// cannot be recovered without it
        #[arg(long)]
        acknowledge: bool,
    },

    /// Show where the master key comes from
    Status,
}

pub async fn run(args: KeyArgs) -> Result<()> {
    let config = Config::load()?;
    let path = config.master_key_path();

    match args.command {
        KeyCommands::Init { acknowledge } => {
            if ensure_master_key_file(&path, acknowledge)? {
                println!("Generated master key at {}", path.display());
                println!("Back this file up. Encrypted values cannot be recovered without it.");
            } else {
                println!("Master key already exists at {}", path.display());
            }
        }
        KeyCommands::Status => {
            let env_var = &config.security.master_key_env;
            if std::env::var_os(env_var).is_some() {
                println!("Master key: from ${}", env_var);
            } else if path.exists() {
                read_master_key_file(&path)?;
                println!("Master key: {}", path.display());
            } else {
                println!("Master key: not configured");
                println!("  Set ${} or run `warden key init --acknowledge`", env_var);
            }
        }
    }

    Ok(())
}
