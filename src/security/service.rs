//! The security façade: one handle composing validation, encryption, rate
//! limiting and audit under a mode-driven policy.
//!
//! A [`SecurityService`] is built once at start-up and shared by `Arc`.
//! The active policy is an immutable snapshot swapped atomically by
//! [`SecurityService::update_config`]; in-flight calls keep the snapshot
//! they started with.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::audit::{
    AuditDetails, AuditEvent, AuditLogger, AuditResult, AuditWriteFailure, Severity, sha256_hex,
};
use super::encryption::{EncryptedValue, EncryptionService, MasterKey, RotationReport};
use super::error::{DecryptionError, EncryptionError};
use super::mode::SecurityMode;
use super::policy::{PolicyBuilder, PolicyError, PolicyOverrides, SecurityPolicy};
use super::rate_limit::{DEFAULT_CATEGORY, RateLimitRule, RateLimitStatus, RateLimiter};
use super::validation::{ValidationOptions, ValidationResult, Validator};

/// Prefix of integrity tags computed with the master key.
pub const HMAC_TAG_PREFIX: &str = "hmac-sha256:";
/// Prefix of integrity tags computed without a master key.
pub const SHA256_TAG_PREFIX: &str = "sha256:";

const KEY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MIN_TICK: Duration = Duration::from_millis(100);

/// What [`SecurityService::encrypt`] returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProtectedValue {
    Encrypted(EncryptedValue),
    /// Encryption is disabled by policy; the value is stored as given.
    Plain(String),
}

impl ProtectedValue {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, ProtectedValue::Encrypted(_))
    }
}

/// Builder for [`SecurityService`].
#[derive(Debug)]
pub struct SecurityServiceBuilder {
    mode: SecurityMode,
    overrides: PolicyOverrides,
    master_key: Option<MasterKey>,
    base_dir: Option<PathBuf>,
    maintenance: bool,
}

impl SecurityServiceBuilder {
    pub fn new(mode: SecurityMode) -> Self {
        Self {
            mode,
            overrides: PolicyOverrides::default(),
            master_key: None,
            base_dir: None,
            maintenance: true,
        }
    }

    pub fn overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn master_key(mut self, key: Option<MasterKey>) -> Self {
        self.master_key = key;
        self
    }

    /// Directory that a relative audit `log_path` is resolved against.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Do not spawn periodic maintenance tasks.
    pub fn without_maintenance(mut self) -> Self {
        self.maintenance = false;
        self
    }

    pub fn build(self) -> Result<SecurityService> {
        let policy = resolve_paths(
            PolicyBuilder::new(self.mode)
                .overrides(self.overrides.clone())
                .build()?,
            self.base_dir.as_deref(),
        );
        let validator = Validator::new(&policy.validation)?;

        let encryption = Arc::new(EncryptionService::new(
            policy.encryption.clone(),
            self.master_key,
        )?);
        if policy.encryption.enabled && !encryption.has_master_key() {
            warn!("Encryption is enabled but no master key is configured; encrypt calls will fail");
        }

        let rate_limiter = Arc::new(RateLimiter::new(RateLimitRule::from(&policy.rate_limit)));
        let audit = AuditLogger::open(policy.audit.clone())?;

        info!("Security service initialized in {} mode", self.mode);

        let service = SecurityService {
            active: RwLock::new(Arc::new(ActivePolicy {
                mode: self.mode,
                overrides: self.overrides,
                policy,
                validator,
            })),
            base_dir: self.base_dir,
            encryption,
            rate_limiter,
            audit,
            update_lock: Mutex::new(()),
            maintenance: Mutex::new(None),
            maintenance_enabled: self.maintenance,
        };
        if service.maintenance_enabled {
            service.start_maintenance();
        }
        Ok(service)
    }
}

/// Immutable policy snapshot.
struct ActivePolicy {
    mode: SecurityMode,
    overrides: PolicyOverrides,
    policy: SecurityPolicy,
    validator: Validator,
}

struct Maintenance {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Unified security service.
pub struct SecurityService {
    active: RwLock<Arc<ActivePolicy>>,
    base_dir: Option<PathBuf>,
    encryption: Arc<EncryptionService>,
    rate_limiter: Arc<RateLimiter>,
    audit: AuditLogger,
    /// Serializes `update_config` so components and `active` change together.
    update_lock: Mutex<()>,
    maintenance: Mutex<Option<Maintenance>>,
    maintenance_enabled: bool,
}

impl SecurityService {
    pub fn builder(mode: SecurityMode) -> SecurityServiceBuilder {
        SecurityServiceBuilder::new(mode)
    }

    pub fn mode(&self) -> SecurityMode {
        self.active().mode
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.active().policy.clone()
    }

    pub fn overrides(&self) -> PolicyOverrides {
        self.active().overrides.clone()
    }

    pub fn has_master_key(&self) -> bool {
        self.encryption.has_master_key()
    }

    pub fn encryption(&self) -> &Arc<EncryptionService> {
        &self.encryption
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate untrusted input. Failures are audited.
    pub fn validate(&self, input: &str, options: &ValidationOptions) -> ValidationResult {
        let active = self.active();
        if !active.policy.validation.enabled {
            return ValidationResult::pass(input);
        }

        let result = active.validator.validate(input, options);
        if !result.valid {
            self.audit_event(
                AuditEvent::new("validation_failed")
                    .severity(Severity::Warning)
                    .source("validation")
                    .result(AuditResult::Denied)
                    .details(AuditDetails::Validation {
                        input_kind: options.kind.to_string(),
                        context: options.context.clone(),
                        errors: result.error_messages(),
                    }),
            );
        }
        result
    }

    // ── Encryption ──────────────────────────────────────────────────

    /// Encrypt under `context`, or pass through as [`ProtectedValue::Plain`]
    /// when encryption is disabled.
    pub fn encrypt(&self, plaintext: &str, context: &str) -> Result<ProtectedValue, EncryptionError> {
        if !self.active().policy.encryption.enabled {
            return Ok(ProtectedValue::Plain(plaintext.to_string()));
        }
        match self.encryption.encrypt(plaintext, context) {
            Ok(value) => {
                self.audit_event(
                    AuditEvent::new("encrypt")
                        .severity(Severity::Debug)
                        .source("encryption")
                        .details(encryption_details(context, "encrypt")),
                );
                Ok(ProtectedValue::Encrypted(value))
            }
            Err(e) => {
                self.audit_event(
                    AuditEvent::new("encryption_failed")
                        .severity(Severity::Error)
                        .source("encryption")
                        .result(AuditResult::Failure)
                        .details(encryption_details(context, "encrypt")),
                );
                Err(e)
            }
        }
    }

    /// Recover plaintext. Encrypted values are decrypted even when the
    /// current policy has encryption disabled.
    pub fn decrypt(&self, value: &ProtectedValue, context: &str) -> Result<String, DecryptionError> {
        let encrypted = match value {
            ProtectedValue::Plain(text) => return Ok(text.clone()),
            ProtectedValue::Encrypted(encrypted) => encrypted,
        };
        self.encryption.decrypt(encrypted, context).inspect_err(|_| {
            self.audit_event(
                AuditEvent::new("decryption_failed")
                    .severity(Severity::Warning)
                    .source("encryption")
                    .result(AuditResult::Failure)
                    .details(encryption_details(context, "decrypt")),
            );
        })
    }

    /// Replace the master key and re-wrap secure-memory entries.
    pub fn rotate_master_key(&self, key: MasterKey) -> Result<RotationReport, EncryptionError> {
        let report = self.encryption.rotate_keys(key)?;
        self.audit_event(
            AuditEvent::new("key_rotation")
                .severity(Severity::Warning)
                .source("encryption")
                .details(AuditDetails::fields([
                    ("rewrapped", report.rewrapped as u64),
                    ("dropped", report.dropped as u64),
                ])),
        );
        Ok(report)
    }

    pub fn hash(&self, data: &str, salt: Option<&[u8]>) -> String {
        self.encryption.hash(data, salt)
    }

    pub fn verify_hash(&self, data: &str, hash: &str) -> bool {
        self.encryption.verify_hash(data, hash)
    }

    pub fn create_mac(&self, data: &str) -> Result<String, EncryptionError> {
        self.encryption.create_mac(data)
    }

    pub fn verify_mac(&self, data: &str, mac: &str) -> bool {
        self.encryption.verify_mac(data, mac)
    }

    /// Integrity tag over `data`: `hmac-sha256:<hex>` with a master key,
    /// `sha256:<hex>` without one.
    pub fn integrity_tag(&self, data: &str) -> String {
        match self.encryption.create_mac(data) {
            Ok(mac) => format!("{}{}", HMAC_TAG_PREFIX, mac),
            Err(_) => format!("{}{}", SHA256_TAG_PREFIX, sha256_hex(data.as_bytes())),
        }
    }

    /// Check a tag from [`integrity_tag`](Self::integrity_tag).
    ///
    /// With a master key loaded only `hmac-sha256:` tags are accepted, so a
    /// recomputed plain digest cannot stand in for the keyed one.
    pub fn verify_integrity_tag(&self, data: &str, tag: &str) -> bool {
        if self.encryption.has_master_key() {
            return tag
                .strip_prefix(HMAC_TAG_PREFIX)
                .is_some_and(|mac| self.encryption.verify_mac(data, mac));
        }
        tag.strip_prefix(SHA256_TAG_PREFIX).is_some_and(|digest| {
            let expected = sha256_hex(data.as_bytes());
            digest.as_bytes().ct_eq(expected.as_bytes()).into()
        })
    }

    // ── Rate limiting ───────────────────────────────────────────────

    /// Count a request from `identifier` in the default category.
    pub fn check_rate_limit(&self, identifier: &str) -> bool {
        self.check_rate_limit_in(DEFAULT_CATEGORY, identifier)
    }

    /// Count a request in `category`. Always allowed when rate limiting is off.
    pub fn check_rate_limit_in(&self, category: &str, identifier: &str) -> bool {
        if !self.active().policy.rate_limit.enabled {
            return true;
        }
        if self.rate_limiter.check_limit(category, identifier) {
            return true;
        }

        let status = self.rate_limiter.status(category, identifier);
        self.audit_event(
            AuditEvent::new("rate_limit_exceeded")
                .severity(Severity::Warning)
                .source("rate_limit")
                .result(AuditResult::Denied)
                .details(AuditDetails::RateLimit {
                    category: category.to_string(),
                    identifier: identifier.to_string(),
                    limit: status.limit,
                }),
        );
        false
    }

    pub fn rate_limit_status(&self, category: &str, identifier: &str) -> RateLimitStatus {
        self.rate_limiter.status(category, identifier)
    }

    /// Give `category` its own limits instead of the policy default.
    pub fn configure_rate_limit(&self, category: &str, rule: RateLimitRule) {
        self.rate_limiter.configure(category, rule);
    }

    // ── Audit ───────────────────────────────────────────────────────

    /// Record an `Info` event from the security layer. Never fails.
    pub fn audit(&self, event_type: &str, details: AuditDetails) {
        self.audit_event(
            AuditEvent::new(event_type)
                .source("security")
                .details(details),
        );
    }

    /// Record an event. Never fails; storage problems surface through
    /// [`AuditLogger::subscribe`].
    pub fn audit_event(&self, event: AuditEvent) {
        self.audit.log_event(event);
    }

    /// Write buffered audit entries now.
    pub async fn flush_audit(&self) -> Result<usize, AuditWriteFailure> {
        self.audit.flush().await
    }

    // ── Configuration ───────────────────────────────────────────────

    /// Rebuild the policy from `mode` (or the current mode) and `overrides`,
    /// then swap it in and reconfigure every component.
    ///
    /// Derived keys are discarded when the encryption policy changed. The
    /// audit directory cannot move while the service is running.
    pub fn update_config(
        &self,
        mode: Option<SecurityMode>,
        overrides: PolicyOverrides,
    ) -> Result<(), PolicyError> {
        let _update = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.active();
        let mode = mode.unwrap_or(current.mode);
        let policy = resolve_paths(
            PolicyBuilder::new(mode).overrides(overrides.clone()).build()?,
            self.base_dir.as_deref(),
        );
        let validator = Validator::new(&policy.validation)?;

        if policy.encryption != current.policy.encryption {
            self.encryption.apply_policy(policy.encryption.clone());
        }
        self.rate_limiter
            .set_default_rule(RateLimitRule::from(&policy.rate_limit));
        self.audit.apply_policy(policy.audit.clone());

        let timing_changed = policy.rate_limit.cleanup_interval
            != current.policy.rate_limit.cleanup_interval
            || policy.audit.flush_interval != current.policy.audit.flush_interval;

        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(ActivePolicy {
            mode,
            overrides,
            policy,
            validator,
        });

        if timing_changed && self.stop_maintenance() {
            self.start_maintenance();
        }

        info!("Security policy updated ({} -> {} mode)", current.mode, mode);
        self.audit_event(
            AuditEvent::new("policy_updated")
                .severity(Severity::Warning)
                .source("policy")
                .details(AuditDetails::fields([
                    ("previous_mode", current.mode.as_str()),
                    ("mode", mode.as_str()),
                ])),
        );
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop maintenance tasks and flush the audit buffer.
    pub async fn shutdown(&self) {
        let tasks = self.take_maintenance();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.audit.flush().await {
            warn!("Final audit flush failed: {}", e);
        }
        debug!("Security service shut down");
    }

    /// Whether periodic maintenance tasks are running.
    pub fn maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn active(&self) -> Arc<ActivePolicy> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Spawn key eviction, rate-limit cleanup and audit flush loops.
    /// Does nothing outside a Tokio runtime.
    fn start_maintenance(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No Tokio runtime; security maintenance tasks not started");
            return;
        };
        let policy = self.policy();
        let (shutdown, rx) = watch::channel(false);

        let encryption = self.encryption.clone();
        let limiter = self.rate_limiter.clone();
        let audit = self.audit.clone();

        let tasks = vec![
            spawn_periodic(&handle, KEY_SWEEP_INTERVAL, rx.clone(), move || {
                let encryption = encryption.clone();
                async move {
                    encryption.evict_expired_keys();
                }
            }),
            spawn_periodic(&handle, policy.rate_limit.cleanup_interval, rx.clone(), move || {
                let limiter = limiter.clone();
                async move {
                    limiter.cleanup();
                }
            }),
            spawn_periodic(&handle, policy.audit.flush_interval, rx, move || {
                let audit = audit.clone();
                async move {
                    let _ = audit.flush().await;
                }
            }),
        ];

        *self.maintenance.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Maintenance { shutdown, tasks });
        debug!("Security maintenance tasks started");
    }

    /// Signal maintenance tasks to stop. Returns whether any were running.
    fn stop_maintenance(&self) -> bool {
        let tasks = self.take_maintenance();
        let running = !tasks.is_empty();
        for task in tasks {
            task.abort();
        }
        running
    }

    fn take_maintenance(&self) -> Vec<JoinHandle<()>> {
        match self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            Some(m) => {
                let _ = m.shutdown.send(true);
                m.tasks
            }
            None => Vec::new(),
        }
    }
}

impl Drop for SecurityService {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}

fn spawn_periodic<F, Fut>(
    handle: &tokio::runtime::Handle,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    handle.spawn(async move {
        let mut interval = tokio::time::interval(period.max(MIN_TICK));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn resolve_paths(mut policy: SecurityPolicy, base: Option<&Path>) -> SecurityPolicy {
    if let Some(base) = base
        && policy.audit.log_path.is_relative()
    {
        policy.audit.log_path = base.join(&policy.audit.log_path);
    }
    policy
}

fn encryption_details(context: &str, operation: &str) -> AuditDetails {
    AuditDetails::Encryption {
        context: context.to_string(),
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{AuditOverrides, EncryptionOverrides, InputKind, RateLimitOverrides};

    fn key() -> Option<MasterKey> {
        Some(MasterKey::new(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap())
    }

    fn service(mode: SecurityMode, dir: &Path) -> SecurityService {
        SecurityService::builder(mode)
            .master_key(key())
            .base_dir(dir)
            .without_maintenance()
            .build()
            .unwrap()
    }

    #[test]
    fn concurrent_updates_leave_components_in_step() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = Arc::new(service(SecurityMode::Standard, tmp.path()));

        let updaters: Vec<_> = [(10, 120_000), (20, 150_000)]
            .into_iter()
            .map(|(max_requests, iterations)| {
                let svc = svc.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        svc.update_config(
                            None,
                            PolicyOverrides {
                                rate_limit: RateLimitOverrides {
                                    max_requests: Some(max_requests),
                                    ..Default::default()
                                },
                                encryption: EncryptionOverrides {
                                    pbkdf2_iterations: Some(iterations),
                                    ..Default::default()
                                },
                                ..Default::default()
                            },
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for updater in updaters {
            updater.join().unwrap();
        }

        let policy = svc.policy();
        assert_eq!(svc.encryption().policy(), policy.encryption);
        assert_eq!(svc.audit_logger().policy(), policy.audit);
        assert_eq!(
            svc.rate_limiter().status(DEFAULT_CATEGORY, "observer").limit,
            policy.rate_limit.max_requests
        );
        assert_eq!(
            svc.overrides().rate_limit.max_requests,
            Some(policy.rate_limit.max_requests)
        );
    }

    #[test]
    fn roundtrip_through_facade() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path());
        let value = svc.encrypt("s3cret", "db").unwrap();
        assert!(value.is_encrypted());
        assert_eq!(svc.decrypt(&value, "db").unwrap(), "s3cret");
        assert!(svc.decrypt(&value, "other").is_err());
    }

    #[test]
    fn basic_mode_passes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Basic, tmp.path());
        let value = svc.encrypt("visible", "ctx").unwrap();
        assert_eq!(value, ProtectedValue::Plain("visible".to_string()));
        assert_eq!(svc.decrypt(&value, "ctx").unwrap(), "visible");
        // rate limiting off
        for _ in 0..1000 {
            assert!(svc.check_rate_limit("anyone"));
        }
    }

    #[test]
    fn persisted_value_survives_new_service() {
        let tmp = tempfile::tempdir().unwrap();
        let stored = {
            let svc = service(SecurityMode::Standard, tmp.path());
            serde_json::to_string(&svc.encrypt("sk-12345", "api_keys").unwrap()).unwrap()
        };

        let svc = service(SecurityMode::Standard, tmp.path());
        let value: ProtectedValue = serde_json::from_str(&stored).unwrap();
        assert!(value.is_encrypted());
        assert_eq!(svc.decrypt(&value, "api_keys").unwrap(), "sk-12345");
        assert!(svc.decrypt(&value, "other").is_err());
    }

    #[test]
    fn rate_limit_allows_five_then_denies() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = SecurityService::builder(SecurityMode::Standard)
            .base_dir(tmp.path())
            .overrides(PolicyOverrides {
                rate_limit: RateLimitOverrides {
                    max_requests: Some(5),
                    ..Default::default()
                },
                ..Default::default()
            })
            .without_maintenance()
            .build()
            .unwrap();

        for _ in 0..5 {
            assert!(svc.check_rate_limit("user-1"));
        }
        assert!(!svc.check_rate_limit("user-1"));
        assert!(!svc.check_rate_limit("user-1"));
        assert!(svc.check_rate_limit("user-2"));
    }

    #[tokio::test]
    async fn validation_failures_are_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path());

        let bad = svc.validate(
            "../../etc/passwd",
            &ValidationOptions::new(InputKind::Path, "upload"),
        );
        assert!(!bad.valid);
        let good = svc.validate(
            "config/settings.yaml",
            &ValidationOptions::new(InputKind::Path, "upload"),
        );
        assert!(good.valid);

        svc.flush_audit().await.unwrap();
        let entries = svc.audit_logger().read_logs(None, None).entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "validation_failed");
        assert_eq!(entries[0].result, AuditResult::Denied);
    }

    #[test]
    fn disabled_validation_passes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = SecurityService::builder(SecurityMode::Standard)
            .base_dir(tmp.path())
            .overrides(PolicyOverrides {
                validation: crate::security::ValidationOverrides {
                    enabled: Some(false),
                    ..Default::default()
                },
                ..Default::default()
            })
            .without_maintenance()
            .build()
            .unwrap();
        let result = svc.validate("<script>", &ValidationOptions::default());
        assert!(result.valid);
        assert_eq!(result.sanitized, "<script>");
    }

    #[test]
    fn hash_passthrough_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path());
        let hashed = svc.hash("pw", None);
        assert!(svc.verify_hash("pw", &hashed));
        assert!(!svc.verify_hash("pw2", &hashed));
    }

    #[test]
    fn integrity_tags_depend_on_key() {
        let tmp = tempfile::tempdir().unwrap();
        let keyed = service(SecurityMode::Enterprise, tmp.path());
        let tag = keyed.integrity_tag("payload");
        assert!(tag.starts_with(HMAC_TAG_PREFIX));
        assert!(tag.len() > HMAC_TAG_PREFIX.len());
        assert!(keyed.verify_integrity_tag("payload", &tag));
        assert!(!keyed.verify_integrity_tag("payl0ad", &tag));

        // A plain digest is not accepted once a key is loaded.
        let digest = format!("{}{}", SHA256_TAG_PREFIX, sha256_hex(b"payload"));
        assert!(!keyed.verify_integrity_tag("payload", &digest));

        let unkeyed = SecurityService::builder(SecurityMode::Basic)
            .base_dir(tmp.path())
            .without_maintenance()
            .build()
            .unwrap();
        let tag = unkeyed.integrity_tag("payload");
        assert_eq!(tag, digest);
        assert!(unkeyed.verify_integrity_tag("payload", &tag));
    }

    #[test]
    fn missing_key_fails_encrypt_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = SecurityService::builder(SecurityMode::Standard)
            .base_dir(tmp.path())
            .without_maintenance()
            .build()
            .unwrap();
        assert!(matches!(
            svc.encrypt("x", "ctx"),
            Err(EncryptionError::MasterKeyUnavailable)
        ));
    }

    #[test]
    fn update_config_switches_mode_and_keeps_data_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path());
        let value = svc.encrypt("before", "ctx").unwrap();

        svc.update_config(Some(SecurityMode::Enterprise), PolicyOverrides::default())
            .unwrap();
        assert_eq!(svc.mode(), SecurityMode::Enterprise);
        assert!(svc.policy().audit.include_stack_trace);
        assert_eq!(svc.encryption().cached_key_count(), 0);
        assert_eq!(svc.decrypt(&value, "ctx").unwrap(), "before");

        // Override-only update keeps the mode.
        svc.update_config(
            None,
            PolicyOverrides {
                encryption: EncryptionOverrides {
                    enabled: Some(false),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(svc.mode(), SecurityMode::Enterprise);
        assert!(!svc.encrypt("after", "ctx").unwrap().is_encrypted());
    }

    #[test]
    fn update_config_rejects_weak_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Secure, tmp.path());
        let err = svc
            .update_config(
                None,
                PolicyOverrides {
                    encryption: EncryptionOverrides {
                        pbkdf2_iterations: Some(1000),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::WeakIterations(1000));
        assert_eq!(svc.mode(), SecurityMode::Secure);
    }

    #[test]
    fn relative_audit_path_resolved_against_base() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = SecurityService::builder(SecurityMode::Standard)
            .base_dir(tmp.path())
            .overrides(PolicyOverrides {
                audit: AuditOverrides {
                    log_path: Some(PathBuf::from("logs/security")),
                    ..Default::default()
                },
                ..Default::default()
            })
            .without_maintenance()
            .build()
            .unwrap();
        assert_eq!(
            svc.audit_logger().dir(),
            tmp.path().join("logs/security").as_path()
        );
    }

    #[test]
    fn key_rotation_is_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(SecurityMode::Standard, tmp.path());
        svc.encryption().store_secret("token", b"abc").unwrap();
        let report = svc.rotate_master_key(MasterKey::generate()).unwrap();
        assert_eq!(report.rewrapped, 1);
        assert!(svc.audit_logger().pending_count() >= 1);
    }

    #[tokio::test]
    async fn maintenance_starts_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = SecurityService::builder(SecurityMode::Standard)
            .master_key(key())
            .base_dir(tmp.path())
            .build()
            .unwrap();
        assert!(svc.maintenance_running());

        svc.audit("manual", AuditDetails::None);
        svc.shutdown().await;
        assert!(!svc.maintenance_running());
        assert_eq!(svc.audit_logger().pending_count(), 0);
        assert_eq!(svc.audit_logger().read_logs(None, None).entries().len(), 1);
    }

    #[test]
    fn no_runtime_means_no_maintenance() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = SecurityService::builder(SecurityMode::Standard)
            .base_dir(tmp.path())
            .build()
            .unwrap();
        assert!(!svc.maintenance_running());
    }
}
