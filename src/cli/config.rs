//! CLI subcommands: `warden config ...`
//!
//! Two groups: management of Warden's own `config.toml` (show, get, set,
//! path, init) and sealed application config files (seal, open, verify).

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use warden::config::{Config, DEFAULT_CONFIG_TEMPLATE};
use warden::secure::{ConfigFormat, FileConfigSource, SealedDocument, SecureConfigLoader};
use warden::security::SecurityMode;

use super::load_config;

/// Caller identity used for rate limiting CLI access.
const CLI_CALLER: &str = "cli";

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., security.mode)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., security.rate_limit.max_requests)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Encrypt sensitive fields of a YAML/JSON/TOML file in place
    Seal {
        file: PathBuf,

        /// Write the sealed document here instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a sealed file with every field decrypted
    Open {
        file: PathBuf,

        /// Print only this field (dotted path, e.g. database.password)
        #[arg(long)]
        field: Option<String>,
    },

    /// Check a sealed file's integrity tag
    Verify { file: PathBuf },
}

pub async fn run(args: ConfigArgs, mode: Option<SecurityMode>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(&format),
        ConfigCommands::Get { key } => get_config(&key),
        ConfigCommands::Set { key, value } => set_config(&key, &value),
        ConfigCommands::Path => show_path(),
        ConfigCommands::Init { force } => init_config(force),
        ConfigCommands::Seal { file, output } => seal_file(file, output, mode).await,
        ConfigCommands::Open { file, field } => open_file(file, field, mode).await,
        ConfigCommands::Verify { file } => verify_file(file, mode).await,
    }
}

fn show_config(format: &str) -> Result<()> {
    let config = Config::load()?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(key: &str) -> Result<()> {
    let config = Config::load()?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.set_value(key, value)?;
    // Reject values that would not build a valid policy.
    warden::security::PolicyBuilder::new(config.security.mode)
        .overrides(config.security.overrides.clone())
        .build()?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn show_path() -> Result<()> {
    let path = Config::config_path()?;
    println!("{}", path.display());
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let path = Config::config_path()?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}

async fn seal_file(
    file: PathBuf,
    output: Option<PathBuf>,
    mode: Option<SecurityMode>,
) -> Result<()> {
    let config = load_config(mode)?;
    let security = Arc::new(config.security_service()?);
    let loader = SecureConfigLoader::new(FileConfigSource, security.clone());

    let result = (|| -> Result<_> {
        let sealed = loader.load(&file, CLI_CALLER)?;
        let document = sealed.open(&security)?;
        let target = output.unwrap_or_else(|| file.clone());
        let saved = loader.save(&target, document, CLI_CALLER)?;
        Ok((target, saved.encrypted_fields()))
    })();
    security.shutdown().await;

    let (target, fields) = result?;
    println!("Sealed {} field(s) into {}", fields.len(), target.display());
    for field in fields {
        println!("  {}", field);
    }
    Ok(())
}

async fn open_file(
    file: PathBuf,
    field: Option<String>,
    mode: Option<SecurityMode>,
) -> Result<()> {
    let config = load_config(mode)?;
    let security = Arc::new(config.security_service()?);
    let loader = SecureConfigLoader::new(FileConfigSource, security.clone());

    let result = (|| -> Result<String> {
        let sealed = loader.load(&file, CLI_CALLER)?;
        match field {
            Some(ref field) => loader
                .reveal(&sealed, field)?
                .with_context(|| format!("No string field `{}`", field)),
            None => ConfigFormat::from_path(&file).render(&sealed.open(&security)?),
        }
    })();
    security.shutdown().await;

    let text = result?;
    println!("{}", text.trim_end());
    Ok(())
}

async fn verify_file(file: PathBuf, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = Arc::new(config.security_service()?);
    let loader = SecureConfigLoader::new(FileConfigSource, security.clone());

    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if !SealedDocument::is_sealed(&ConfigFormat::from_path(&file).parse(&text)?) {
        anyhow::bail!("{} is not sealed; run `warden config seal` first", file.display());
    }

    let result = loader.load(&file, CLI_CALLER);
    security.shutdown().await;

    let sealed = result?;
    println!("{}: integrity ok ({})", file.display(), sealed.integrity());
    Ok(())
}
