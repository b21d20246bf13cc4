pub mod audit;
pub mod config;
pub mod crypt;
pub mod key;
pub mod paths;
pub mod resources;
pub mod validate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use warden::config::Config;
use warden::security::SecurityMode;

#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "Policy-driven validation, encryption, rate limiting and audit")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the security mode from config.toml
    #[arg(short, long, global = true, env = "WARDEN_MODE")]
    pub mode: Option<SecurityMode>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Encrypt a value under a context label
    Encrypt(crypt::EncryptArgs),

    /// Decrypt a value produced by `encrypt`
    Decrypt(crypt::DecryptArgs),

    /// Hash a value, or verify a value against a hash
    Hash(crypt::HashArgs),

    /// Validate untrusted input
    Validate(validate::ValidateArgs),

    /// Inspect and verify the audit log
    Audit(audit::AuditArgs),

    /// Configuration management and sealed config files
    Config(config::ConfigArgs),

    /// Show system resources or check an allocation
    Resources(resources::ResourcesArgs),

    /// Master key management
    Key(key::KeyArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Positional value, or stdin when absent (trailing newline stripped).
pub fn value_or_stdin(value: Option<String>) -> Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read stdin")?;
    if buf.ends_with('\n') {
        buf.pop();
        if buf.ends_with('\r') {
            buf.pop();
        }
    }
    Ok(buf)
}

/// Load config.toml, applying the `--mode` override.
pub fn load_config(mode: Option<SecurityMode>) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(mode) = mode {
        config.security.mode = mode;
    }
    Ok(config)
}
