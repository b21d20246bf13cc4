//! Config loading with the security layer in front.
//!
//! [`SecureConfigLoader`] wraps a plain [`ConfigSource`]: every call is rate
//! limited per caller, paths and content are validated, sensitive fields
//! are sealed before anything is cached or written, and both the attempt
//! and the outcome are audited.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::sealed::{ConfigFormat, SealedDocument};
use crate::security::{
    AuditDetails, AuditEvent, AuditResult, InputKind, SecureAccessError, SecurityService,
    Severity, ValidationOptions,
};

/// Rate-limit category for config access.
pub const CONFIG_RATE_CATEGORY: &str = "config";

/// Raw storage behind the loader.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSource: Send + Sync {
    fn read(&self, path: &Path) -> Result<String>;
    fn write(&self, path: &Path, contents: &str) -> Result<()>;
}

/// Reads and writes config files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConfigSource;

impl ConfigSource for FileConfigSource {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Write via a sibling temp file and rename, owner-only on Unix.
    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("warden-tmp");
        fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move config into place at {}", path.display()))
    }
}

pub struct SecureConfigLoader<S: ConfigSource> {
    source: S,
    security: Arc<SecurityService>,
    cache: Mutex<HashMap<PathBuf, SealedDocument>>,
}

impl<S: ConfigSource> SecureConfigLoader<S> {
    pub fn new(source: S, security: Arc<SecurityService>) -> Self {
        Self {
            source,
            security,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load a config file, sealing it if it is still plain.
    ///
    /// A sealed file whose integrity tag does not match is rejected.
    pub fn load(&self, path: &Path, caller: &str) -> Result<SealedDocument, SecureAccessError> {
        let label = path.display().to_string();
        self.admit(caller, &label)?;
        self.audit("config_load_attempt", Severity::Info, AuditResult::Success, &label, Vec::new());

        let text = self.source.read(path).inspect_err(|e| {
            warn!("Config read failed for {}: {}", label, e);
            self.audit("config_load_failed", Severity::Error, AuditResult::Failure, &label, Vec::new());
        })?;

        let check = self.security.validate(
            &text,
            &ValidationOptions::new(InputKind::Config, format!("config:{}", label)),
        );
        if !check.valid {
            return Err(SecureAccessError::InvalidInput(check.error_messages()));
        }

        let value = ConfigFormat::from_path(path)
            .parse(&text)
            .map_err(|e| SecureAccessError::Malformed(e.to_string()))?;

        let sealed = if SealedDocument::is_sealed(&value) {
            let sealed = SealedDocument::from_value(value)?;
            if !self.check_integrity(&sealed, &label) {
                return Err(SecureAccessError::IntegrityViolation(label));
            }
            sealed
        } else {
            debug!("Sealing plain config {}", label);
            SealedDocument::seal(&self.security, value)?
        };

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), sealed.clone());
        self.audit(
            "config_loaded",
            Severity::Info,
            AuditResult::Success,
            &label,
            sealed.encrypted_fields(),
        );
        Ok(sealed)
    }

    /// Seal `document` and write it to `path` in the format its extension
    /// names.
    ///
    /// The rendered file passes the same content validation as [`load`](Self::load)
    /// before anything is written.
    pub fn save(
        &self,
        path: &Path,
        document: Value,
        caller: &str,
    ) -> Result<SealedDocument, SecureAccessError> {
        let label = path.display().to_string();
        self.admit(caller, &label)?;
        self.audit("config_save_attempt", Severity::Info, AuditResult::Success, &label, Vec::new());

        let sealed = SealedDocument::seal(&self.security, document)?;
        let text = ConfigFormat::from_path(path)
            .render(&sealed.to_value()?)
            .map_err(|e| SecureAccessError::Malformed(e.to_string()))?;

        let check = self.security.validate(
            &text,
            &ValidationOptions::new(InputKind::Config, format!("config:{}", label)),
        );
        if !check.valid {
            self.audit("config_save_failed", Severity::Warning, AuditResult::Denied, &label, Vec::new());
            return Err(SecureAccessError::InvalidInput(check.error_messages()));
        }

        self.source.write(path, &text).inspect_err(|e| {
            warn!("Config write failed for {}: {}", label, e);
            self.audit("config_save_failed", Severity::Error, AuditResult::Failure, &label, Vec::new());
        })?;

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), sealed.clone());
        self.audit(
            "config_saved",
            Severity::Info,
            AuditResult::Success,
            &label,
            sealed.encrypted_fields(),
        );
        Ok(sealed)
    }

    /// Plaintext of one field of a loaded config.
    pub fn reveal(
        &self,
        config: &SealedDocument,
        field: &str,
    ) -> Result<Option<String>, SecureAccessError> {
        if !self.check_integrity(config, field) {
            return Err(SecureAccessError::IntegrityViolation(field.to_string()));
        }
        let value = config.reveal(&self.security, field)?;
        self.audit(
            "config_field_revealed",
            Severity::Info,
            AuditResult::Success,
            "",
            vec![field.to_string()],
        );
        Ok(value)
    }

    /// Check a document's integrity tag. Mismatches are audited.
    pub fn validate_integrity(&self, document: &SealedDocument) -> bool {
        self.check_integrity(document, "sealed document")
    }

    /// Last document loaded from or saved to `path`.
    pub fn cached(&self, path: &Path) -> Option<SealedDocument> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn admit(&self, caller: &str, label: &str) -> Result<(), SecureAccessError> {
        if !self
            .security
            .check_rate_limit_in(CONFIG_RATE_CATEGORY, caller)
        {
            return Err(SecureAccessError::RateLimited(caller.to_string()));
        }
        let check = self
            .security
            .validate(label, &ValidationOptions::new(InputKind::Path, "config_path"));
        if !check.valid {
            return Err(SecureAccessError::InvalidInput(check.error_messages()));
        }
        Ok(())
    }

    fn check_integrity(&self, document: &SealedDocument, target: &str) -> bool {
        if document.verify(&self.security) {
            return true;
        }
        warn!("Integrity check failed for {}", target);
        self.security.audit_event(
            AuditEvent::new("config_integrity_violation")
                .severity(Severity::Critical)
                .source("config")
                .result(AuditResult::Denied)
                .details(AuditDetails::Integrity {
                    target: target.to_string(),
                    detail: "integrity tag mismatch".to_string(),
                }),
        );
        false
    }

    fn audit(
        &self,
        event_type: &str,
        severity: Severity,
        result: AuditResult,
        path: &str,
        fields: Vec<String>,
    ) {
        self.security.audit_event(
            AuditEvent::new(event_type)
                .severity(severity)
                .source("config")
                .result(result)
                .details(AuditDetails::Config {
                    path: path.to_string(),
                    fields,
                }),
        );
    }
}
