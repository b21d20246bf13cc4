//! CLI subcommand: `warden validate`

use anyhow::Result;
use clap::{Args, ValueEnum};
use warden::security::{InputKind, SecurityMode, ValidationOptions};

use super::{load_config, value_or_stdin};

#[derive(Clone, Copy, ValueEnum)]
pub enum Kind {
    None,
    Path,
    Config,
    Template,
}

impl From<Kind> for InputKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::None => InputKind::None,
            Kind::Path => InputKind::Path,
            Kind::Config => InputKind::Config,
            Kind::Template => InputKind::Template,
        }
    }
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Type-specific checks to run
    #[arg(short, long, value_enum, default_value = "none")]
    pub kind: Kind,

    /// Free-text label recorded in audit entries
    #[arg(short, long, default_value = "cli")]
    pub context: String,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,

    /// Input to validate (read from stdin when omitted)
    pub input: Option<String>,
}

pub async fn run(args: ValidateArgs, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = config.security_service()?;
    let input = value_or_stdin(args.input)?;

    let result = security.validate(
        &input,
        &ValidationOptions::new(args.kind.into(), args.context),
    );
    security.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.valid {
        println!("valid");
    } else {
        for error in &result.errors {
            println!("invalid: {}", error);
        }
    }

    if !result.valid {
        anyhow::bail!("{} validation error(s)", result.errors.len());
    }
    Ok(())
}
