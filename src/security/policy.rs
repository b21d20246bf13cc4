//! Layered security policy.
//!
//! A [`SecurityPolicy`] is produced by [`PolicyBuilder`], which applies
//! three layers in a fixed order:
//!
//! 1. Global defaults ([`SecurityPolicy::global_defaults`])
//! 2. Mode defaults for the chosen [`SecurityMode`]
//! 3. Explicit [`PolicyOverrides`] from configuration or code
//!
//! Later layers win field by field. The result is an immutable value;
//! changing anything means building a new one.
//!
//! Mode defaults form a single strictness order across all four
//! sub-policies: every field of mode N+1 is at least as strict as the same
//! field in mode N. [`SecurityPolicy::looser_than`] reports the fields that
//! break this, and the builder warns when an explicit override loosens the
//! mode baseline.

use serde::{Deserialize, Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use super::audit::Severity;
use super::encryption::{CipherAlgorithm, KeyDerivation};
use super::mode::SecurityMode;

/// PBKDF2 iteration floor. Lower values are rejected at build time.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Smallest accepted salt.
pub const MIN_SALT_LENGTH: usize = 16;

/// Built-in blocklist: path traversal, script tags, SQL keywords and
/// template-injection markers.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    r"\.\.[/\\]",
    r"(?i)%2e%2e(%2f|%5c|/|\\)",
    r"\x00",
    r"(?i)<\s*/?\s*script\b",
    r"(?i)javascript\s*:",
    r"(?i)\bon(load|error|click|mouseover|focus)\s*=",
    r"(?i)\bunion\s+(all\s+)?select\b",
    r"(?i)\b(drop|truncate)\s+(table|database)\b",
    r"(?i)\binsert\s+into\b",
    r"(?i)\bdelete\s+from\b",
    r"(?i)'\s*or\s+'?\d+'?\s*=\s*'?\d+",
    r";\s*--",
    r"\$\{",
    r"<%",
    r"\{\{[^}]*(constructor|__proto__|prototype|process|require|import)",
];

/// Input validation sub-policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationPolicy {
    pub enabled: bool,
    /// Maximum input size in bytes.
    pub max_size: usize,
    /// Regular expressions; any match rejects the input.
    pub blocked_patterns: Vec<String>,
}

/// Encryption sub-policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncryptionPolicy {
    pub enabled: bool,
    pub algorithm: CipherAlgorithm,
    pub key_derivation: KeyDerivation,
    /// Random salt length in bytes, generated per encryption.
    pub salt_length: usize,
    pub pbkdf2_iterations: u32,
    /// Maximum number of cached derived keys.
    pub key_cache_size: usize,
    #[serde(serialize_with = "as_millis")]
    pub key_idle_timeout: Duration,
    /// Absolute lifetime of a cached derived key.
    #[serde(serialize_with = "as_millis")]
    pub key_rotation_interval: Duration,
}

/// Rate limiting sub-policy (the default category).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub max_requests: u32,
    #[serde(serialize_with = "as_millis")]
    pub window: Duration,
    #[serde(serialize_with = "as_millis")]
    pub block_duration: Duration,
    #[serde(serialize_with = "as_millis")]
    pub cleanup_interval: Duration,
}

/// Audit sub-policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditPolicy {
    pub enabled: bool,
    pub min_severity: Severity,
    /// Directory holding the audit segments.
    pub log_path: PathBuf,
    pub include_stack_trace: bool,
    /// Buffered entries that trigger an immediate flush.
    pub buffer_size: usize,
    #[serde(serialize_with = "as_millis")]
    pub flush_interval: Duration,
    #[serde(serialize_with = "as_millis")]
    pub flush_timeout: Duration,
    /// Active segment size that triggers rotation.
    pub max_segment_bytes: u64,
    /// Rotated segments kept on disk.
    pub retention_segments: usize,
    /// Failed flushes tolerated before a batch is dropped.
    pub max_write_retries: u32,
}

/// Complete merged policy for one mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityPolicy {
    pub mode: SecurityMode,
    pub validation: ValidationPolicy,
    pub encryption: EncryptionPolicy,
    pub rate_limit: RateLimitPolicy,
    pub audit: AuditPolicy,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;
const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

impl SecurityPolicy {
    /// Layer 1: values used when neither the mode nor the caller says otherwise.
    pub fn global_defaults() -> Self {
        Self {
            mode: SecurityMode::Basic,
            validation: ValidationPolicy {
                enabled: true,
                max_size: 10 * MIB,
                blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            },
            encryption: EncryptionPolicy {
                enabled: false,
                algorithm: CipherAlgorithm::Aes256Gcm,
                key_derivation: KeyDerivation::Pbkdf2Sha256,
                salt_length: MIN_SALT_LENGTH,
                pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
                key_cache_size: 256,
                key_idle_timeout: 5 * MINUTE,
                key_rotation_interval: 24 * HOUR,
            },
            rate_limit: RateLimitPolicy {
                enabled: false,
                max_requests: 1000,
                window: MINUTE,
                block_duration: Duration::ZERO,
                cleanup_interval: MINUTE,
            },
            audit: AuditPolicy {
                enabled: false,
                min_severity: Severity::Info,
                log_path: PathBuf::from("audit"),
                include_stack_trace: false,
                buffer_size: 100,
                flush_interval: 5 * SECOND,
                flush_timeout: 5 * SECOND,
                max_segment_bytes: 10 * MIB as u64,
                retention_segments: 10,
                max_write_retries: 3,
            },
        }
    }

    /// Layers 1 and 2: global defaults with the mode's values applied.
    pub fn mode_defaults(mode: SecurityMode) -> Self {
        let mut policy = Self::global_defaults();
        policy.mode = mode;

        match mode {
            SecurityMode::Basic => {}
            SecurityMode::Standard => {
                policy.validation.max_size = 5 * MIB;

                policy.encryption.enabled = true;

                policy.rate_limit.enabled = true;
                policy.rate_limit.max_requests = 100;
                policy.rate_limit.block_duration = MINUTE;

                policy.audit.enabled = true;
            }
            SecurityMode::Secure => {
                policy.validation.max_size = MIB;

                policy.encryption.enabled = true;
                policy.encryption.salt_length = 32;
                policy.encryption.pbkdf2_iterations = 210_000;
                policy.encryption.key_rotation_interval = 12 * HOUR;

                policy.rate_limit.enabled = true;
                policy.rate_limit.max_requests = 50;
                policy.rate_limit.block_duration = 5 * MINUTE;

                policy.audit.enabled = true;
                policy.audit.flush_interval = 2 * SECOND;
            }
            SecurityMode::Enterprise => {
                policy.validation.max_size = 512 * KIB;

                policy.encryption.enabled = true;
                policy.encryption.salt_length = 32;
                policy.encryption.pbkdf2_iterations = 310_000;
                policy.encryption.key_idle_timeout = 2 * MINUTE;
                policy.encryption.key_rotation_interval = HOUR;

                policy.rate_limit.enabled = true;
                policy.rate_limit.max_requests = 20;
                policy.rate_limit.block_duration = 15 * MINUTE;

                policy.audit.enabled = true;
                policy.audit.min_severity = Severity::Debug;
                policy.audit.include_stack_trace = true;
                policy.audit.buffer_size = 20;
                policy.audit.flush_interval = SECOND;
            }
        }

        policy
    }

    /// Fields in which `self` is more permissive than `baseline`.
    ///
    /// Used to check the mode ordering and to flag overrides that weaken
    /// the chosen mode. Algorithm choices are not ordered and never reported.
    pub fn looser_than(&self, baseline: &SecurityPolicy) -> Vec<&'static str> {
        let mut looser = Vec::new();
        let (v, bv) = (&self.validation, &baseline.validation);
        if !v.enabled && bv.enabled {
            looser.push("validation.enabled");
        }
        if v.max_size > bv.max_size {
            looser.push("validation.max_size");
        }
        if bv
            .blocked_patterns
            .iter()
            .any(|p| !v.blocked_patterns.contains(p))
        {
            looser.push("validation.blocked_patterns");
        }

        let (e, be) = (&self.encryption, &baseline.encryption);
        if !e.enabled && be.enabled {
            looser.push("encryption.enabled");
        }
        if e.salt_length < be.salt_length {
            looser.push("encryption.salt_length");
        }
        if e.pbkdf2_iterations < be.pbkdf2_iterations {
            looser.push("encryption.pbkdf2_iterations");
        }
        if e.key_idle_timeout > be.key_idle_timeout {
            looser.push("encryption.key_idle_timeout");
        }
        if e.key_rotation_interval > be.key_rotation_interval {
            looser.push("encryption.key_rotation_interval");
        }

        let (r, br) = (&self.rate_limit, &baseline.rate_limit);
        if !r.enabled && br.enabled {
            looser.push("rate_limit.enabled");
        }
        // Compared as a rate (requests per window length).
        if (r.max_requests as u128) * br.window.as_millis()
            > (br.max_requests as u128) * r.window.as_millis()
        {
            looser.push("rate_limit.max_requests");
        }
        if r.block_duration < br.block_duration {
            looser.push("rate_limit.block_duration");
        }

        let (a, ba) = (&self.audit, &baseline.audit);
        if !a.enabled && ba.enabled {
            looser.push("audit.enabled");
        }
        if a.min_severity > ba.min_severity {
            looser.push("audit.min_severity");
        }
        if !a.include_stack_trace && ba.include_stack_trace {
            looser.push("audit.include_stack_trace");
        }

        looser
    }
}

/// Explicit per-field overrides (layer 3). `None` keeps the mode default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub validation: ValidationOverrides,
    pub encryption: EncryptionOverrides,
    pub rate_limit: RateLimitOverrides,
    pub audit: AuditOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    /// Replaces the built-in blocklist entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_patterns: Option<Vec<String>>,
    /// Appended to whichever blocklist is in effect.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_blocked_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<CipherAlgorithm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_derivation: Option<KeyDerivation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbkdf2_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_cache_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_idle_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_rotation_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_stack_trace: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_segment_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_segments: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_write_retries: Option<u32>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn set_ms(slot: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *slot = Duration::from_millis(ms);
    }
}

impl PolicyOverrides {
    /// Layer 3: apply every `Some` field on top of `policy`.
    fn apply(&self, policy: &mut SecurityPolicy) {
        let v = &self.validation;
        set(&mut policy.validation.enabled, v.enabled);
        set(&mut policy.validation.max_size, v.max_size);
        set(
            &mut policy.validation.blocked_patterns,
            v.blocked_patterns.clone(),
        );
        for pattern in &v.extra_blocked_patterns {
            if !policy.validation.blocked_patterns.contains(pattern) {
                policy.validation.blocked_patterns.push(pattern.clone());
            }
        }

        let e = &self.encryption;
        set(&mut policy.encryption.enabled, e.enabled);
        set(&mut policy.encryption.algorithm, e.algorithm);
        set(&mut policy.encryption.key_derivation, e.key_derivation);
        set(&mut policy.encryption.salt_length, e.salt_length);
        set(&mut policy.encryption.pbkdf2_iterations, e.pbkdf2_iterations);
        set(&mut policy.encryption.key_cache_size, e.key_cache_size);
        set_ms(&mut policy.encryption.key_idle_timeout, e.key_idle_timeout_ms);
        set_ms(
            &mut policy.encryption.key_rotation_interval,
            e.key_rotation_interval_ms,
        );

        let r = &self.rate_limit;
        set(&mut policy.rate_limit.enabled, r.enabled);
        set(&mut policy.rate_limit.max_requests, r.max_requests);
        set_ms(&mut policy.rate_limit.window, r.window_ms);
        set_ms(&mut policy.rate_limit.block_duration, r.block_duration_ms);
        set_ms(&mut policy.rate_limit.cleanup_interval, r.cleanup_interval_ms);

        let a = &self.audit;
        set(&mut policy.audit.enabled, a.enabled);
        set(&mut policy.audit.min_severity, a.min_severity);
        set(&mut policy.audit.log_path, a.log_path.clone());
        set(&mut policy.audit.include_stack_trace, a.include_stack_trace);
        set(&mut policy.audit.buffer_size, a.buffer_size);
        set_ms(&mut policy.audit.flush_interval, a.flush_interval_ms);
        set_ms(&mut policy.audit.flush_timeout, a.flush_timeout_ms);
        set(&mut policy.audit.max_segment_bytes, a.max_segment_bytes);
        set(&mut policy.audit.retention_segments, a.retention_segments);
        set(&mut policy.audit.max_write_retries, a.max_write_retries);
    }
}

/// Rejected policy values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("pbkdf2_iterations must be at least {MIN_PBKDF2_ITERATIONS} (got {0})")]
    WeakIterations(u32),
    #[error("salt_length must be at least {MIN_SALT_LENGTH} bytes (got {0})")]
    ShortSalt(usize),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid blocked pattern `{pattern}`: {reason}")]
    BadPattern { pattern: String, reason: String },
}

/// Builds one immutable [`SecurityPolicy`] from the three layers.
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    mode: SecurityMode,
    overrides: PolicyOverrides,
}

impl PolicyBuilder {
    pub fn new(mode: SecurityMode) -> Self {
        Self {
            mode,
            overrides: PolicyOverrides::default(),
        }
    }

    pub fn overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(&self) -> Result<SecurityPolicy, PolicyError> {
        let baseline = SecurityPolicy::mode_defaults(self.mode);
        let mut policy = baseline.clone();
        self.overrides.apply(&mut policy);

        check(&policy)?;

        for field in policy.looser_than(&baseline) {
            warn!(
                "Override of {} is looser than the {} mode default",
                field, self.mode
            );
        }

        Ok(policy)
    }
}

fn check(policy: &SecurityPolicy) -> Result<(), PolicyError> {
    let e = &policy.encryption;
    if e.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
        return Err(PolicyError::WeakIterations(e.pbkdf2_iterations));
    }
    if e.salt_length < MIN_SALT_LENGTH {
        return Err(PolicyError::ShortSalt(e.salt_length));
    }
    if e.key_cache_size == 0 {
        return Err(PolicyError::Zero("encryption.key_cache_size"));
    }
    if policy.validation.max_size == 0 {
        return Err(PolicyError::Zero("validation.max_size"));
    }
    if policy.rate_limit.max_requests == 0 {
        return Err(PolicyError::Zero("rate_limit.max_requests"));
    }
    if policy.rate_limit.window.is_zero() {
        return Err(PolicyError::Zero("rate_limit.window"));
    }
    if policy.audit.buffer_size == 0 {
        return Err(PolicyError::Zero("audit.buffer_size"));
    }
    for pattern in &policy.validation.blocked_patterns {
        if let Err(e) = regex::Regex::new(pattern) {
            return Err(PolicyError::BadPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_are_monotonically_stricter() {
        for pair in SecurityMode::ALL.windows(2) {
            let laxer = SecurityPolicy::mode_defaults(pair[0]);
            let stricter = SecurityPolicy::mode_defaults(pair[1]);
            let violations = stricter.looser_than(&laxer);
            assert!(
                violations.is_empty(),
                "{} is looser than {} in {:?}",
                pair[1],
                pair[0],
                violations
            );
        }
    }

    #[test]
    fn basic_mode_keeps_only_validation() {
        let policy = PolicyBuilder::new(SecurityMode::Basic).build().unwrap();
        assert!(policy.validation.enabled);
        assert!(!policy.encryption.enabled);
        assert!(!policy.rate_limit.enabled);
        assert!(!policy.audit.enabled);
    }

    #[test]
    fn enterprise_always_includes_stack_traces() {
        let policy = PolicyBuilder::new(SecurityMode::Enterprise).build().unwrap();
        assert!(policy.audit.include_stack_trace);
        let secure = SecurityPolicy::mode_defaults(SecurityMode::Secure);
        assert!(policy.validation.max_size < secure.validation.max_size);
    }

    #[test]
    fn explicit_overrides_beat_mode_defaults() {
        let mut overrides = PolicyOverrides::default();
        overrides.rate_limit.max_requests = Some(5);
        overrides.rate_limit.window_ms = Some(1_000);
        overrides.encryption.enabled = Some(true);

        let policy = PolicyBuilder::new(SecurityMode::Basic)
            .overrides(overrides)
            .build()
            .unwrap();

        assert_eq!(policy.rate_limit.max_requests, 5);
        assert_eq!(policy.rate_limit.window, Duration::from_secs(1));
        assert!(policy.encryption.enabled);
        // Untouched fields keep the mode value
        assert!(!policy.rate_limit.enabled);
    }

    #[test]
    fn mode_defaults_beat_global_defaults() {
        let global = SecurityPolicy::global_defaults();
        let secure = SecurityPolicy::mode_defaults(SecurityMode::Secure);
        assert_ne!(global.validation.max_size, secure.validation.max_size);
        assert_eq!(secure.validation.max_size, MIB);
    }

    #[test]
    fn weak_iterations_rejected() {
        let mut overrides = PolicyOverrides::default();
        overrides.encryption.pbkdf2_iterations = Some(1_000);
        let err = PolicyBuilder::new(SecurityMode::Standard)
            .overrides(overrides)
            .build()
            .unwrap_err();
        assert_eq!(err, PolicyError::WeakIterations(1_000));
    }

    #[test]
    fn invalid_pattern_rejected() {
        let mut overrides = PolicyOverrides::default();
        overrides.validation.extra_blocked_patterns = vec!["(unclosed".to_string()];
        let err = PolicyBuilder::new(SecurityMode::Standard)
            .overrides(overrides)
            .build()
            .unwrap_err();
        assert!(matches!(err, PolicyError::BadPattern { .. }));
    }

    #[test]
    fn loosening_override_is_reported() {
        let mut overrides = PolicyOverrides::default();
        overrides.audit.min_severity = Some(Severity::Critical);
        overrides.validation.max_size = Some(100 * MIB);

        let baseline = SecurityPolicy::mode_defaults(SecurityMode::Secure);
        let policy = PolicyBuilder::new(SecurityMode::Secure)
            .overrides(overrides)
            .build()
            .unwrap();

        let looser = policy.looser_than(&baseline);
        assert!(looser.contains(&"audit.min_severity"));
        assert!(looser.contains(&"validation.max_size"));
    }

    #[test]
    fn overrides_parse_from_toml() {
        let toml_src = r#"
            [rate_limit]
            max_requests = 10
            window_ms = 30000

            [audit]
            min_severity = "warning"
            log_path = "/var/log/warden"
        "#;
        let overrides: PolicyOverrides = toml::from_str(toml_src).unwrap();
        assert_eq!(overrides.rate_limit.max_requests, Some(10));
        assert_eq!(overrides.audit.min_severity, Some(Severity::Warning));
        assert_eq!(
            overrides.audit.log_path.as_deref(),
            Some(std::path::Path::new("/var/log/warden"))
        );
    }
}
