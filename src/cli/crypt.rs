//! CLI subcommands: `warden encrypt`, `warden decrypt`, `warden hash`

use anyhow::{Context, Result};
use clap::Args;
use warden::security::{ProtectedValue, SecurityMode};

use super::{load_config, value_or_stdin};

#[derive(Args)]
pub struct EncryptArgs {
    /// Context label the value is bound to (e.g. "api_keys")
    #[arg(short, long)]
    pub context: String,

    /// Plaintext (read from stdin when omitted)
    pub value: Option<String>,
}

#[derive(Args)]
pub struct DecryptArgs {
    /// Context label used at encryption time
    #[arg(short, long)]
    pub context: String,

    /// JSON produced by `warden encrypt` (read from stdin when omitted)
    pub value: Option<String>,
}

#[derive(Args)]
pub struct HashArgs {
    /// Verify against this hash instead of printing a new one
    #[arg(long)]
    pub verify: Option<String>,

    /// Data to hash (read from stdin when omitted)
    pub value: Option<String>,
}

pub async fn encrypt(args: EncryptArgs, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = config.security_service()?;
    let plaintext = value_or_stdin(args.value)?;

    let result = security.encrypt(&plaintext, &args.context);
    security.shutdown().await;
    let value = result?;

    if !value.is_encrypted() {
        eprintln!("Encryption is disabled in {} mode; value left as plain text", security.mode());
    }
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

pub async fn decrypt(args: DecryptArgs, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = config.security_service()?;
    let input = value_or_stdin(args.value)?;
    let value: ProtectedValue =
        serde_json::from_str(input.trim()).context("Input is not an encrypted value")?;

    let result = security.decrypt(&value, &args.context);
    security.shutdown().await;
    println!("{}", result?);
    Ok(())
}

pub async fn hash(args: HashArgs, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = config.security_service()?;
    let data = value_or_stdin(args.value)?;

    let outcome = match args.verify {
        Some(ref expected) => {
            if security.verify_hash(&data, expected) {
                println!("match");
                Ok(())
            } else {
                Err(anyhow::anyhow!("hash does not match"))
            }
        }
        None => {
            println!("{}", security.hash(&data, None));
            Ok(())
        }
    };
    security.shutdown().await;
    outcome
}
