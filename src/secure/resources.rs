//! System resource detection behind the security layer.
//!
//! [`SecureResourceDetector`] wraps a plain [`ResourceDetector`] the same way
//! the config loader wraps its source: callers are rate limited, the host
//! name is sealed, every report carries an integrity tag, and detections
//! and allocation checks are audited.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::security::{
    AuditDetails, AuditEvent, AuditResult, InputKind, ProtectedValue, SecureAccessError,
    SecurityService, Severity, ValidationOptions,
};

/// Rate-limit category for resource queries.
pub const RESOURCE_RATE_CATEGORY: &str = "resources";

/// Share of available memory an allocation may claim.
const ALLOCATION_HEADROOM_PERCENT: u64 = 80;

/// How long a report answers allocation checks before re-detecting.
const REPORT_TTL: Duration = Duration::from_secs(5);

const HOSTNAME_CONTEXT: &str = "resources.hostname";

/// Raw host facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    pub total_memory: u64,
    pub available_memory: u64,
    pub cpu_count: usize,
    /// 1, 5 and 15 minute load averages, where the platform reports them.
    pub load_average: Option<[f64; 3]>,
    pub hostname: String,
    pub platform: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait ResourceDetector: Send + Sync {
    fn detect(&self) -> Result<SystemResources>;
}

/// Reads resources from the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResourceDetector;

impl ResourceDetector for SystemResourceDetector {
    fn detect(&self) -> Result<SystemResources> {
        let (total_memory, available_memory) = memory_info()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine system memory"))?;
        Ok(SystemResources {
            total_memory,
            available_memory,
            cpu_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            load_average: load_average(),
            hostname: hostname().unwrap_or_else(|| "unknown".to_string()),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        })
    }
}

#[cfg(target_os = "linux")]
fn memory_info() -> Option<(u64, u64)> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok();
    meminfo
        .as_deref()
        .and_then(parse_meminfo)
        .or_else(sysconf_memory)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn memory_info() -> Option<(u64, u64)> {
    sysconf_memory()
}

#[cfg(not(unix))]
fn memory_info() -> Option<(u64, u64)> {
    None
}

/// `(MemTotal, MemAvailable)` in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        let line = text.lines().find(|l| l.starts_with(name))?;
        let kib: u64 = line[name.len()..]
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .ok()?;
        kib.checked_mul(1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total, available))
}

#[cfg(unix)]
fn sysconf_memory() -> Option<(u64, u64)> {
    // SAFETY: sysconf has no preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    let total = (pages as u64).checked_mul(page_size as u64)?;

    #[cfg(target_os = "linux")]
    let available = {
        // SAFETY: as above.
        let free = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
        if free > 0 {
            (free as u64).checked_mul(page_size as u64).unwrap_or(total)
        } else {
            total
        }
    };
    #[cfg(not(target_os = "linux"))]
    let available = total;

    Some((total, available))
}

#[cfg(unix)]
fn load_average() -> Option<[f64; 3]> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds the three samples requested.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n == 3).then_some(loads)
}

#[cfg(not(unix))]
fn load_average() -> Option<[f64; 3]> {
    None
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes at most `buf.len()` bytes.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// A detection result with the host name sealed and an integrity tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub total_memory: u64,
    pub available_memory: u64,
    pub cpu_count: usize,
    pub load_average: Option<[f64; 3]>,
    pub platform: String,
    pub hostname: ProtectedValue,
    pub detected_at: DateTime<Utc>,
    pub integrity: String,
}

impl ResourceReport {
    /// Everything but the tag, as compact JSON with sorted keys.
    fn canonical(&self) -> Result<String, SecureAccessError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| SecureAccessError::Malformed(e.to_string()))?;
        if let Some(map) = value.as_object_mut() {
            map.remove("integrity");
        }
        serde_json::to_string(&value).map_err(|e| SecureAccessError::Malformed(e.to_string()))
    }
}

/// Outcome of [`SecureResourceDetector::check_allocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationDecision {
    pub allowed: bool,
    pub requested_bytes: u64,
    pub available_bytes: u64,
    /// Largest allocation that would be allowed.
    pub headroom_bytes: u64,
}

pub struct SecureResourceDetector<D: ResourceDetector> {
    detector: D,
    security: Arc<SecurityService>,
    last: Mutex<Option<(Instant, ResourceReport)>>,
}

impl<D: ResourceDetector> SecureResourceDetector<D> {
    pub fn new(detector: D, security: Arc<SecurityService>) -> Self {
        Self {
            detector,
            security,
            last: Mutex::new(None),
        }
    }

    /// Detect resources now and cache the sealed report.
    pub fn detect(&self, caller: &str) -> Result<ResourceReport, SecureAccessError> {
        self.admit(caller)?;
        self.audit(
            AuditEvent::new("resource_detection_attempt").details(resource_details(None, None, "detect")),
        );

        let resources = self.detector.detect().inspect_err(|e| {
            warn!("Resource detection failed: {}", e);
            self.audit(
                AuditEvent::new("resource_detection_failed")
                    .severity(Severity::Error)
                    .result(AuditResult::Failure)
                    .details(resource_details(None, None, "detector error")),
            );
        })?;

        let report = self.seal(resources)?;
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((Instant::now(), report.clone()));
        self.audit(
            AuditEvent::new("resource_detected").details(resource_details(
                None,
                Some(report.available_memory),
                "detected",
            )),
        );
        Ok(report)
    }

    /// Decide whether `bytes` fits within the allocation headroom.
    ///
    /// Reuses the cached report while it is fresh.
    pub fn check_allocation(
        &self,
        caller: &str,
        bytes: u64,
    ) -> Result<AllocationDecision, SecureAccessError> {
        if bytes == 0 {
            self.audit(
                AuditEvent::new("allocation_rejected")
                    .severity(Severity::Warning)
                    .result(AuditResult::Denied)
                    .details(resource_details(Some(0), None, "zero-byte request")),
            );
            return Err(SecureAccessError::InvalidInput(vec![
                "requested allocation must be greater than zero".to_string(),
            ]));
        }

        let report = match self.fresh_report() {
            Some(report) => {
                self.admit(caller)?;
                report
            }
            None => self.detect(caller)?,
        };

        let headroom =
            (u128::from(report.available_memory) * u128::from(ALLOCATION_HEADROOM_PERCENT) / 100) as u64;
        let decision = AllocationDecision {
            allowed: bytes <= headroom,
            requested_bytes: bytes,
            available_bytes: report.available_memory,
            headroom_bytes: headroom,
        };

        let (severity, result, detail) = if decision.allowed {
            (Severity::Info, AuditResult::Success, "allowed")
        } else {
            (Severity::Warning, AuditResult::Denied, "exceeds headroom")
        };
        self.audit(
            AuditEvent::new("allocation_check")
                .severity(severity)
                .result(result)
                .details(resource_details(
                    Some(bytes),
                    Some(report.available_memory),
                    detail,
                )),
        );
        Ok(decision)
    }

    /// Check a report's integrity tag. Mismatches are audited.
    pub fn validate_integrity(&self, report: &ResourceReport) -> bool {
        let valid = report
            .canonical()
            .is_ok_and(|payload| self.security.verify_integrity_tag(&payload, &report.integrity));
        if !valid {
            warn!("Resource report failed integrity check");
            self.audit(
                AuditEvent::new("resource_integrity_violation")
                    .severity(Severity::Critical)
                    .result(AuditResult::Denied)
                    .details(AuditDetails::Integrity {
                        target: "resource report".to_string(),
                        detail: "integrity tag mismatch".to_string(),
                    }),
            );
        }
        valid
    }

    /// Host name from a report, decrypted.
    pub fn hostname(&self, report: &ResourceReport) -> Result<String, SecureAccessError> {
        Ok(self.security.decrypt(&report.hostname, HOSTNAME_CONTEXT)?)
    }

    /// Last report produced by [`detect`](Self::detect).
    pub fn cached_report(&self) -> Option<ResourceReport> {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, report)| report.clone())
    }

    fn fresh_report(&self) -> Option<ResourceReport> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let (at, report) = last.as_ref()?;
        if at.elapsed() < REPORT_TTL {
            debug!("Using cached resource report");
            Some(report.clone())
        } else {
            None
        }
    }

    fn seal(&self, resources: SystemResources) -> Result<ResourceReport, SecureAccessError> {
        let mut report = ResourceReport {
            total_memory: resources.total_memory,
            available_memory: resources.available_memory,
            cpu_count: resources.cpu_count,
            load_average: resources.load_average,
            platform: resources.platform,
            hostname: self.security.encrypt(&resources.hostname, HOSTNAME_CONTEXT)?,
            detected_at: Utc::now(),
            integrity: String::new(),
        };
        report.integrity = self.security.integrity_tag(&report.canonical()?);
        Ok(report)
    }

    fn admit(&self, caller: &str) -> Result<(), SecureAccessError> {
        if !self
            .security
            .check_rate_limit_in(RESOURCE_RATE_CATEGORY, caller)
        {
            return Err(SecureAccessError::RateLimited(caller.to_string()));
        }
        let check = self.security.validate(
            caller,
            &ValidationOptions::new(InputKind::None, "resource_caller"),
        );
        if !check.valid {
            return Err(SecureAccessError::InvalidInput(check.error_messages()));
        }
        Ok(())
    }

    fn audit(&self, event: AuditEvent) {
        self.security.audit_event(event.source("resources"));
    }
}

fn resource_details(requested: Option<u64>, available: Option<u64>, detail: &str) -> AuditDetails {
    AuditDetails::Resource {
        requested_bytes: requested,
        available_bytes: available,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{MasterKey, PolicyOverrides, RateLimitOverrides, SecurityMode};
    use std::path::Path;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn service(mode: SecurityMode, dir: &Path) -> Arc<SecurityService> {
        Arc::new(
            SecurityService::builder(mode)
                .master_key(Some(MasterKey::new(vec![9u8; 32]).unwrap()))
                .base_dir(dir)
                .without_maintenance()
                .build()
                .unwrap(),
        )
    }

    fn resources(available: u64) -> SystemResources {
        SystemResources {
            total_memory: 16 * GIB,
            available_memory: available,
            cpu_count: 8,
            load_average: Some([0.5, 0.4, 0.3]),
            hostname: "build-host-7".to_string(),
            platform: "linux-x86_64".to_string(),
        }
    }

    #[test]
    fn report_seals_hostname_and_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockResourceDetector::new();
        mock.expect_detect().times(1).returning(|| Ok(resources(8 * GIB)));

        let detector = SecureResourceDetector::new(mock, service(SecurityMode::Standard, tmp.path()));
        let report = detector.detect("tester").unwrap();
        assert!(report.hostname.is_encrypted());
        assert!(report.integrity.starts_with("hmac-sha256:"));
        assert!(detector.validate_integrity(&report));
        assert_eq!(detector.hostname(&report).unwrap(), "build-host-7");
        assert_eq!(detector.cached_report(), Some(report));
    }

    #[test]
    fn tampered_report_fails_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockResourceDetector::new();
        mock.expect_detect().returning(|| Ok(resources(8 * GIB)));

        let detector = SecureResourceDetector::new(mock, service(SecurityMode::Standard, tmp.path()));
        let mut report = detector.detect("tester").unwrap();
        report.available_memory *= 2;
        assert!(!detector.validate_integrity(&report));
    }

    #[test]
    fn allocation_uses_headroom_and_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockResourceDetector::new();
        mock.expect_detect().times(1).returning(|| Ok(resources(10 * GIB)));

        let detector = SecureResourceDetector::new(mock, service(SecurityMode::Standard, tmp.path()));
        let ok = detector.check_allocation("tester", 4 * GIB).unwrap();
        assert!(ok.allowed);
        assert_eq!(ok.headroom_bytes, 8 * GIB);

        let too_big = detector.check_allocation("tester", 9 * GIB).unwrap();
        assert!(!too_big.allowed);
        assert_eq!(too_big.available_bytes, 10 * GIB);
    }

    #[test]
    fn zero_allocation_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockResourceDetector::new();
        mock.expect_detect().never();

        let detector = SecureResourceDetector::new(mock, service(SecurityMode::Standard, tmp.path()));
        assert!(matches!(
            detector.check_allocation("tester", 0),
            Err(SecureAccessError::InvalidInput(_))
        ));
    }

    #[test]
    fn detector_errors_surface_as_source() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockResourceDetector::new();
        mock.expect_detect()
            .returning(|| Err(anyhow::anyhow!("no /proc")));

        let detector = SecureResourceDetector::new(mock, service(SecurityMode::Standard, tmp.path()));
        assert!(matches!(
            detector.detect("tester"),
            Err(SecureAccessError::Source(_))
        ));
        assert!(detector.cached_report().is_none());
    }

    #[test]
    fn callers_are_rate_limited() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = Arc::new(
            SecurityService::builder(SecurityMode::Standard)
                .master_key(Some(MasterKey::generate()))
                .base_dir(tmp.path())
                .overrides(PolicyOverrides {
                    rate_limit: RateLimitOverrides {
                        max_requests: Some(1),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .without_maintenance()
                .build()
                .unwrap(),
        );
        let mut mock = MockResourceDetector::new();
        mock.expect_detect().times(1).returning(|| Ok(resources(GIB)));

        let detector = SecureResourceDetector::new(mock, svc);
        detector.detect("noisy").unwrap();
        assert!(matches!(
            detector.detect("noisy"),
            Err(SecureAccessError::RateLimited(_))
        ));
    }

    #[test]
    fn basic_mode_leaves_hostname_plain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut mock = MockResourceDetector::new();
        mock.expect_detect().returning(|| Ok(resources(GIB)));

        let detector = SecureResourceDetector::new(mock, service(SecurityMode::Basic, tmp.path()));
        let report = detector.detect("tester").unwrap();
        assert_eq!(report.hostname, ProtectedValue::Plain("build-host-7".to_string()));
        assert!(detector.validate_integrity(&report));
    }

    #[test]
    fn meminfo_parsing() {
        let text = "MemTotal:       16318480 kB\nMemFree:         1020000 kB\nMemAvailable:    8159240 kB\n";
        assert_eq!(
            parse_meminfo(text),
            Some((16318480 * 1024, 8159240 * 1024))
        );
        assert_eq!(
            parse_meminfo("MemTotal: 100 kB\nMemFree: 40 kB\n"),
            Some((100 * 1024, 40 * 1024))
        );
        assert_eq!(parse_meminfo("garbage"), None);
        let huge = format!("MemTotal: {} kB\nMemAvailable: 10 kB\n", u64::MAX);
        assert_eq!(parse_meminfo(&huge), None);
    }

    #[test]
    fn system_detector_reports_memory() {
        let resources = SystemResourceDetector.detect().unwrap();
        assert!(resources.total_memory > 0);
        assert!(resources.available_memory <= resources.total_memory);
        assert!(resources.cpu_count >= 1);
    }
}
