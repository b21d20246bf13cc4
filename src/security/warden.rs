//! # Warden Security Module
//!
//! Central security module for Warden. This file is the **front door**
//! for security auditing: all security-critical types, constants and
//! functions are re-exported here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  warden.rs (you are here)                        │
//! │                  Public API facade & documentation               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  service.rs - SecurityService: mode-driven façade, maintenance   │
//! ├───────────────┬──────────────┬──────────────┬───────────────────┤
//! │ validation.rs │ encryption.rs│ rate_limit.rs│ audit.rs          │
//! │ Size, block-  │ AEAD, KDFs,  │ Fixed window │ Hash-chained      │
//! │ list, path/   │ key cache,   │ + blocking   │ JSONL segments,   │
//! │ config/tmpl   │ MAC, hashing │ per key      │ retry, retention  │
//! ├───────────────┴──────────────┴──────────────┴───────────────────┤
//! │  policy.rs + mode.rs - layered policy builder, strictness order  │
//! │  keyfile.rs - master key lookup and operator-gated generation    │
//! │  redact.rs - secret and PII masking for audit details            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Layered policy**: global defaults, then mode defaults, then
//!    explicit overrides. Modes are totally ordered by strictness; an
//!    override that loosens a mode default is allowed but logged.
//!
//! 2. **Context-bound encryption**: every ciphertext is bound to a context
//!    label through both key derivation and associated data. A value can
//!    only be opened under the label it was sealed with.
//!
//! 3. **Opaque failures**: decryption errors carry no detail. Key material
//!    never appears in `Debug` output, logs, errors or serialized state.
//!
//! 4. **Tamper-evident audit**: entries are hash-chained across segments
//!    and restarts. Audit storage failures never break the audited
//!    operation; they are retried, then replaced by a critical record.
//!
//! 5. **Explicit key custody**: the master key comes from the environment
//!    or a key file. Nothing generates a key without operator consent.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warden::security::{InputKind, SecurityMode, SecurityService, ValidationOptions};
//!
//! let security = SecurityService::builder(SecurityMode::Standard)
//!     .master_key(load_master_key("WARDEN_MASTER_KEY", Some(&key_path))?)
//!     .base_dir(&state_dir)
//!     .build()?;
//!
//! let check = security.validate(path, &ValidationOptions::new(InputKind::Path, "upload"));
//! if !check.valid {
//!     return Err(...);
//! }
//!
//! let sealed = security.encrypt("sk-12345", "api_keys")?;
//! let plain = security.decrypt(&sealed, "api_keys")?;
//! ```
//!
//! ## File Hierarchy
//!
//! ```text
//! ~/.local/share/warden/                    # Data directory
//! └── master.key                            # 32-byte master key (0600)
//!
//! ~/.local/state/warden/                    # State directory
//! └── audit/
//!     ├── .audit.lock                       # Cross-process write lock
//!     ├── audit.jsonl                       # Active segment
//!     └── audit-<ts>-<seq>.jsonl            # Rotated segments
//! ```
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | Path traversal / injection in inputs | Validation blocklist + kind validators |
//! | Ciphertext moved to another field | Context bound into KDF and AAD |
//! | Ciphertext or tag modified | AEAD authentication |
//! | Sealed config edited on disk | Keyed integrity tag over the document |
//! | Integrity tag downgraded to plain digest | Only keyed tags accepted with a key |
//! | Brute force against an endpoint | Rate limit with blocking |
//! | Audit log edited or truncated | Hash chain verification |
//! | Secrets in audit details | Redaction before hashing |

// ── Modes & Policy ──────────────────────────────────────────────────

pub use super::mode::SecurityMode;
pub use super::policy::{
    AuditOverrides, AuditPolicy, DEFAULT_BLOCKED_PATTERNS, EncryptionOverrides, EncryptionPolicy,
    MIN_PBKDF2_ITERATIONS, MIN_SALT_LENGTH, PolicyBuilder, PolicyError, PolicyOverrides,
    RateLimitOverrides, RateLimitPolicy, SecurityPolicy, ValidationOverrides, ValidationPolicy,
};

// ── Service Façade ──────────────────────────────────────────────────

pub use super::service::{
    HMAC_TAG_PREFIX, ProtectedValue, SHA256_TAG_PREFIX, SecurityService, SecurityServiceBuilder,
};

// ── Validation ──────────────────────────────────────────────────────

pub use super::validation::{
    InputKind, ValidationError, ValidationErrorKind, ValidationOptions, ValidationResult,
    Validator,
};

// ── Encryption & Keys ───────────────────────────────────────────────

pub use super::encryption::{
    CipherAlgorithm, EncryptedValue, EncryptionService, KeyDerivation, MasterKey, RotationReport,
    secure_erase,
};
pub use super::error::{DecryptionError, EncryptionError, SecureAccessError};
pub use super::keyfile::{ensure_master_key_file, load_master_key, read_master_key_file};

// ── Rate Limiting ───────────────────────────────────────────────────

pub use super::rate_limit::{DEFAULT_CATEGORY, RateLimitRule, RateLimitStatus, RateLimiter};

// ── Audit Log ───────────────────────────────────────────────────────

pub use super::audit::{
    AuditDetails, AuditEvent, AuditLogEntry, AuditLogger, AuditNotice, AuditQuery, AuditResult,
    AuditWriteFailure, GENESIS_HASH, IntegrityReport, Scalar, Severity,
};
pub use super::redact::{REDACTED, is_sensitive_name, redact_text};

// ── Constants ───────────────────────────────────────────────────────

/// Environment variable consulted for the master key when the config
/// does not name another one.
pub const MASTER_KEY_ENV: &str = "WARDEN_MASTER_KEY";

/// Filename of the master key inside the data directory.
pub const MASTER_KEY_FILENAME: &str = "master.key";
