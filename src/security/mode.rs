//! Operating modes, ordered from most permissive to strictest.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Security operating mode.
///
/// The derived `Ord` is the strictness order: `Basic < Standard < Secure < Enterprise`.
/// A policy value is built for exactly one mode; switching modes rebuilds
/// every sub-policy from scratch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Validation only. Encryption, rate limiting and audit are off.
    Basic,
    /// Everything on with moderate thresholds.
    #[default]
    Standard,
    /// Tighter size limits, stronger key derivation, longer blocks.
    Secure,
    /// Strictest thresholds; audit entries always carry stack traces.
    Enterprise,
}

impl SecurityMode {
    pub const ALL: [SecurityMode; 4] = [
        SecurityMode::Basic,
        SecurityMode::Standard,
        SecurityMode::Secure,
        SecurityMode::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Basic => "basic",
            SecurityMode::Standard => "standard",
            SecurityMode::Secure => "secure",
            SecurityMode::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(SecurityMode::Basic),
            "standard" => Ok(SecurityMode::Standard),
            "secure" => Ok(SecurityMode::Secure),
            "enterprise" => Ok(SecurityMode::Enterprise),
            other => Err(format!(
                "unknown security mode '{}' (expected basic, standard, secure or enterprise)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_are_ordered_by_strictness() {
        assert!(SecurityMode::Basic < SecurityMode::Standard);
        assert!(SecurityMode::Standard < SecurityMode::Secure);
        assert!(SecurityMode::Secure < SecurityMode::Enterprise);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            "Enterprise".parse::<SecurityMode>().unwrap(),
            SecurityMode::Enterprise
        );
        assert_eq!(" basic ".parse::<SecurityMode>().unwrap(), SecurityMode::Basic);
        assert!("paranoid".parse::<SecurityMode>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&SecurityMode::Secure).unwrap();
        assert_eq!(json, "\"secure\"");
    }
}
