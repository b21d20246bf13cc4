//! CLI subcommand: `warden resources`

use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use warden::secure::{SecureResourceDetector, SystemResourceDetector};
use warden::security::SecurityMode;

use super::load_config;

const CLI_CALLER: &str = "cli";

#[derive(Args)]
pub struct ResourcesArgs {
    /// Check whether an allocation of this many bytes fits
    #[arg(long)]
    pub allocate: Option<u64>,

    /// Print the sealed report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ResourcesArgs, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = Arc::new(config.security_service()?);
    let detector = SecureResourceDetector::new(SystemResourceDetector, security.clone());

    let result = (|| -> Result<()> {
        let report = detector.detect(CLI_CALLER)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("Host:       {}", detector.hostname(&report)?);
            println!("Platform:   {}", report.platform);
            println!("CPUs:       {}", report.cpu_count);
            println!(
                "Memory:     {} available of {}",
                format_bytes(report.available_memory),
                format_bytes(report.total_memory)
            );
            if let Some([one, five, fifteen]) = report.load_average {
                println!("Load:       {:.2} {:.2} {:.2}", one, five, fifteen);
            }
            println!("Integrity:  {}", report.integrity);
        }

        if let Some(bytes) = args.allocate {
            let decision = detector.check_allocation(CLI_CALLER, bytes)?;
            println!(
                "Allocation of {}: {} (headroom {})",
                format_bytes(bytes),
                if decision.allowed { "allowed" } else { "denied" },
                format_bytes(decision.headroom_bytes)
            );
            if !decision.allowed {
                anyhow::bail!("allocation exceeds available headroom");
            }
        }
        Ok(())
    })();

    security.shutdown().await;
    result
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(8 * 1024 * 1024 * 1024), "8.0 GiB");
    }
}
