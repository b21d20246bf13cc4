//! CLI subcommand: `warden paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;
use warden::config::Config;

pub fn run() -> Result<()> {
    let config = Config::load()?;
    let paths = &config.paths;

    println!("Warden Paths (XDG Base Directory)");
    println!("=================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("Data:       {}", paths.data_dir.display());
    println!("  master key:     {}", config.master_key_path().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    let audit_dir = match config.security.overrides.audit.log_path {
        Some(ref path) => paths.state_dir.join(path),
        None => paths.audit_dir(),
    };
    println!("  audit log:      {}", audit_dir.display());

    Ok(())
}
