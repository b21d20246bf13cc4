//! CLI subcommands: `warden audit show`, `warden audit verify`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use warden::security::{AuditLogEntry, SecurityMode, Severity};

use super::load_config;

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show persisted audit entries
    Show {
        /// Only entries at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,

        /// Only entries at or before this RFC 3339 time
        #[arg(long)]
        until: Option<String>,

        /// Minimum severity to show
        #[arg(long)]
        severity: Option<Severity>,

        /// Show only the newest N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Verify the hash chain
    Verify {
        /// Only require entries at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,

        /// Only require entries at or before this RFC 3339 time
        #[arg(long)]
        until: Option<String>,
    },
}

pub async fn run(args: AuditArgs, mode: Option<SecurityMode>) -> Result<()> {
    let config = load_config(mode)?;
    let security = config.security_service()?;
    let logger = security.audit_logger().clone();

    match args.command {
        AuditCommands::Show {
            since,
            until,
            severity,
            limit,
            json,
        } => {
            let entries: Vec<AuditLogEntry> = logger
                .read_logs(parse_time(since.as_deref())?, parse_time(until.as_deref())?)
                .entries()
                .into_iter()
                .filter(|e| severity.is_none_or(|min| e.severity >= min))
                .collect();
            let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));

            println!("Audit log: {}", logger.dir().display());
            for entry in entries.iter().skip(skip) {
                if json {
                    println!("{}", serde_json::to_string(entry)?);
                } else {
                    println!(
                        "{}  {:<8} {:<28} {:<8} {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.severity.to_string(),
                        entry.event_type,
                        format!("{:?}", entry.result).to_lowercase(),
                        entry.source
                    );
                }
            }
        }
        AuditCommands::Verify { since, until } => {
            let report = logger
                .integrity_report(parse_time(since.as_deref())?, parse_time(until.as_deref())?);
            println!("Audit log: {}", logger.dir().display());
            println!("Entries checked: {}", report.checked);
            if report.valid {
                println!("Chain: intact");
            } else {
                println!(
                    "Chain: BROKEN at entry {} ({})",
                    report.first_break.unwrap_or_default(),
                    report.reason.as_deref().unwrap_or("unknown")
                );
                anyhow::bail!("audit chain verification failed");
            }
        }
    }

    security.shutdown().await;
    Ok(())
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid RFC 3339 time: {}", v))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_times() {
        assert!(parse_time(None).unwrap().is_none());
        let t = parse_time(Some("2026-01-02T03:04:05+01:00")).unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2026-01-02T02:04:05+00:00");
        assert!(parse_time(Some("yesterday")).is_err());
    }
}
