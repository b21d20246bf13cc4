//! Append-only, hash-chained security audit log.
//!
//! Entries are buffered in memory and flushed as JSONL to a directory of
//! segments. Each entry carries the hash of its predecessor, forming a
//! tamper-evident chain that continues across segment rotation and
//! process restarts.
//!
//! # Format
//!
//! One JSON object per line. Each entry includes:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `id` | Random UUID |
//! | `timestamp` | RFC 3339 UTC timestamp |
//! | `type` | Event name: `validation_failed`, `config_load`, ... |
//! | `severity` | `debug`, `info`, `warning`, `error`, `critical` |
//! | `source` | Component that raised the event |
//! | `result` | `success`, `failure` or `denied` |
//! | `details` | Tagged object, see [`AuditDetails`] |
//! | `stack_trace` | Present only when the policy asks for it |
//! | `hash` | SHA-256 of the entry without `hash`, followed by `previous_hash` |
//! | `previous_hash` | `hash` of the preceding entry |
//!
//! # Chain Integrity
//!
//! The first entry uses `000...000` (64 zeros) as `previous_hash`. If the
//! last persisted line is corrupted when a logger opens, a
//! `chain_recovery` entry is written whose `previous_hash` is the SHA-256
//! of the raw corrupted line.
//!
//! # Segments
//!
//! `audit.jsonl` is the active segment. Once it reaches the configured size
//! it is renamed to `audit-<timestamp>-<seq>.jsonl`; rotated segments
//! beyond the retention count are deleted oldest first. All segment writes
//! happen under an advisory lock on `.audit.lock`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::backtrace::Backtrace;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::policy::AuditPolicy;
use super::redact::{REDACTED, is_sensitive_name, redact_text};
use crate::concurrency::{FileLock, FileLockGuard};

const ACTIVE_SEGMENT: &str = "audit.jsonl";
const SEGMENT_PREFIX: &str = "audit-";
const SEGMENT_SUFFIX: &str = ".jsonl";
const LOCK_FILENAME: &str = ".audit.lock";
const NOTICE_CAPACITY: usize = 64;
const LOCK_POLL: Duration = Duration::from_millis(10);

/// The hash used for the first entry in the chain (no predecessor).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        })
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    #[default]
    Success,
    Failure,
    Denied,
}

/// Scalar value for unclassified audit metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

/// Structured event details.
///
/// Known shapes get their own variant; anything else goes into
/// [`AuditDetails::Fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetails {
    #[default]
    None,
    Encryption {
        context: String,
        operation: String,
    },
    RateLimit {
        category: String,
        identifier: String,
        limit: u32,
    },
    Validation {
        input_kind: String,
        context: String,
        errors: Vec<String>,
    },
    Config {
        path: String,
        /// Field paths involved (names only, never values).
        fields: Vec<String>,
    },
    Resource {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_bytes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        available_bytes: Option<u64>,
        detail: String,
    },
    Integrity {
        target: String,
        detail: String,
    },
    WriteFailure {
        attempts: u32,
        dropped_entries: usize,
        error: String,
    },
    Fields {
        fields: BTreeMap<String, Scalar>,
    },
}

impl AuditDetails {
    /// Build a [`AuditDetails::Fields`] map.
    pub fn fields<K, V, I>(items: I) -> Self
    where
        K: Into<String>,
        V: Into<Scalar>,
        I: IntoIterator<Item = (K, V)>,
    {
        AuditDetails::Fields {
            fields: items
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Mask secrets and personal data in every free-text value.
    fn redacted(self) -> Self {
        fn r(s: String) -> String {
            redact_text(&s).into_owned()
        }

        match self {
            AuditDetails::None => AuditDetails::None,
            AuditDetails::Encryption { context, operation } => AuditDetails::Encryption {
                context: r(context),
                operation,
            },
            AuditDetails::RateLimit {
                category,
                identifier,
                limit,
            } => AuditDetails::RateLimit {
                category,
                identifier: r(identifier),
                limit,
            },
            AuditDetails::Validation {
                input_kind,
                context,
                errors,
            } => AuditDetails::Validation {
                input_kind,
                context: r(context),
                errors: errors.into_iter().map(r).collect(),
            },
            AuditDetails::Config { path, fields } => AuditDetails::Config {
                path: r(path),
                fields,
            },
            AuditDetails::Resource {
                requested_bytes,
                available_bytes,
                detail,
            } => AuditDetails::Resource {
                requested_bytes,
                available_bytes,
                detail: r(detail),
            },
            AuditDetails::Integrity { target, detail } => AuditDetails::Integrity {
                target: r(target),
                detail: r(detail),
            },
            AuditDetails::WriteFailure {
                attempts,
                dropped_entries,
                error,
            } => AuditDetails::WriteFailure {
                attempts,
                dropped_entries,
                error: r(error),
            },
            AuditDetails::Fields { fields } => AuditDetails::Fields {
                fields: fields
                    .into_iter()
                    .map(|(k, v)| {
                        let v = if is_sensitive_name(&k) {
                            Scalar::Text(REDACTED.to_string())
                        } else {
                            match v {
                                Scalar::Text(t) => Scalar::Text(r(t)),
                                other => other,
                            }
                        };
                        (k, v)
                    })
                    .collect(),
            },
        }
    }
}

/// An event to be logged. Built with [`AuditEvent::new`] and the chained setters.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub result: AuditResult,
    pub details: AuditDetails,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            severity: Severity::Info,
            source: "warden".to_string(),
            result: AuditResult::Success,
            details: AuditDetails::None,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    pub fn details(mut self, details: AuditDetails) -> Self {
        self.details = details;
        self
    }
}

/// A persisted audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub result: AuditResult,
    #[serde(default)]
    pub details: AuditDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub hash: String,
    pub previous_hash: String,
}

/// Borrowed view of an entry without its `hash`; the canonical hash input.
#[derive(Serialize)]
struct Unhashed<'a> {
    id: &'a str,
    timestamp: &'a DateTime<Utc>,
    #[serde(rename = "type")]
    event_type: &'a str,
    severity: Severity,
    source: &'a str,
    result: AuditResult,
    details: &'a AuditDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<&'a str>,
    previous_hash: &'a str,
}

impl AuditLogEntry {
    fn seal(
        event: AuditEvent,
        previous_hash: String,
        stack_trace: Option<String>,
    ) -> serde_json::Result<Self> {
        let mut entry = AuditLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event.event_type,
            severity: event.severity,
            source: event.source,
            result: event.result,
            details: event.details,
            stack_trace,
            hash: String::new(),
            previous_hash,
        };
        entry.hash = entry.compute_hash()?;
        Ok(entry)
    }

    /// Recompute this entry's hash from its other fields.
    pub fn compute_hash(&self) -> serde_json::Result<String> {
        let canonical = serde_json::to_string(&Unhashed {
            id: &self.id,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            severity: self.severity,
            source: &self.source,
            result: self.result,
            details: &self.details,
            stack_trace: self.stack_trace.as_deref(),
            previous_hash: &self.previous_hash,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hasher.update(self.previous_hash.as_bytes());
        Ok(hex(&hasher.finalize()))
    }
}

/// Delivered to subscribers when persisting entries fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditNotice {
    /// A flush failed; the batch is queued for another attempt.
    WriteFailed {
        attempt: u32,
        pending: usize,
        error: String,
    },
    /// Retries are exhausted; buffered entries were discarded.
    BatchDropped { dropped: usize, error: String },
}

/// Returned by [`AuditLogger::flush`] when entries could not be persisted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("audit write failed (attempt {attempts}): {message}")]
pub struct AuditWriteFailure {
    pub attempts: u32,
    pub message: String,
}

/// Outcome of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    /// Entries inside the requested range that were verified.
    pub checked: usize,
    /// Line index (across all segments, oldest first) of the first break.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_break: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IntegrityReport {
    fn broken(index: usize, checked: usize, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            checked,
            first_break: Some(index),
            reason: Some(reason.into()),
        }
    }
}

/// Persisted entries filtered by time.
///
/// Reading happens on iteration and every iteration re-reads the segments,
/// so a query can be iterated repeatedly and observes newly flushed
/// entries. Malformed lines are skipped. Buffered entries that have not
/// been flushed are not visible.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    dir: PathBuf,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        let lines = match read_all_lines(&self.dir) {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Failed to read audit log: {:#}", e);
                return Vec::new();
            }
        };
        lines
            .iter()
            .filter_map(|line| serde_json::from_str::<AuditLogEntry>(line).ok())
            .filter(|entry| in_range(entry, self.start, self.end))
            .collect()
    }
}

impl IntoIterator for &AuditQuery {
    type Item = AuditLogEntry;
    type IntoIter = std::vec::IntoIter<AuditLogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries().into_iter()
    }
}

#[derive(Debug, Clone)]
struct PendingLine {
    hash: String,
    line: String,
}

struct ChainState {
    /// Hash of the newest entry, buffered or persisted.
    head: String,
    /// Hash of the newest entry known to be on disk.
    persisted: String,
    pending: VecDeque<PendingLine>,
    failed_attempts: u32,
}

struct Inner {
    dir: PathBuf,
    policy: RwLock<AuditPolicy>,
    chain: Mutex<ChainState>,
    flush_gate: tokio::sync::Mutex<()>,
    notices: broadcast::Sender<AuditNotice>,
}

/// Buffered, hash-chained audit logger. Cheap to clone; clones share state.
///
/// Flushing happens when the buffer reaches `buffer_size`, immediately for
/// `Critical` events, and whenever [`flush`](Self::flush) is called (the
/// owning service calls it every `flush_interval`).
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

impl AuditLogger {
    /// Open the log directory named by `policy.log_path`, resuming the chain
    /// from the last persisted entry. The directory is created on first write.
    pub fn open(policy: AuditPolicy) -> Result<Self> {
        let dir = policy.log_path.clone();
        let head = if dir.is_dir() {
            resume_chain(&dir, &policy)?
        } else {
            GENESIS_HASH.to_string()
        };
        debug!(
            "Audit log at {} resumes from {}",
            dir.display(),
            head.get(..12).unwrap_or(&head)
        );

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                policy: RwLock::new(policy),
                chain: Mutex::new(ChainState {
                    head: head.clone(),
                    persisted: head,
                    pending: VecDeque::new(),
                    failed_attempts: 0,
                }),
                flush_gate: tokio::sync::Mutex::new(()),
                notices,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn policy(&self) -> AuditPolicy {
        self.inner
            .policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the policy. The log directory is fixed for the logger's lifetime.
    pub fn apply_policy(&self, mut policy: AuditPolicy) {
        let mut current = self.inner.policy.write().unwrap_or_else(|e| e.into_inner());
        if policy.log_path != current.log_path {
            warn!(
                "Ignoring audit log path change to {}; the log stays at {}",
                policy.log_path.display(),
                current.log_path.display()
            );
            policy.log_path = current.log_path.clone();
        }
        *current = policy;
    }

    /// Receive write-failure notices.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditNotice> {
        self.inner.notices.subscribe()
    }

    /// Entries buffered but not yet persisted.
    pub fn pending_count(&self) -> usize {
        self.chain().pending.len()
    }

    /// Hash of the newest entry, buffered or persisted.
    pub fn head_hash(&self) -> String {
        self.chain().head.clone()
    }

    /// Record an event. Returns the sealed entry, or `None` when the event
    /// was filtered out (logging disabled or below `min_severity`).
    ///
    /// Never fails: serialization problems are logged and the event is lost.
    pub fn log_event(&self, event: AuditEvent) -> Option<AuditLogEntry> {
        let policy = self.policy();
        if !policy.enabled || event.severity < policy.min_severity {
            return None;
        }

        let critical = event.severity == Severity::Critical;
        let stack_trace = policy
            .include_stack_trace
            .then(|| Backtrace::force_capture().to_string());
        let event = AuditEvent {
            details: event.details.redacted(),
            ..event
        };

        let (entry, flush_now) = {
            let mut chain = self.chain();
            let (entry, line) = match seal_line(event, chain.head.clone(), stack_trace) {
                Ok(sealed) => sealed,
                Err(e) => {
                    error!("Failed to serialize audit entry: {}", e);
                    return None;
                }
            };
            chain.head = entry.hash.clone();
            chain.pending.push_back(PendingLine {
                hash: entry.hash.clone(),
                line,
            });
            (entry, critical || chain.pending.len() >= policy.buffer_size)
        };

        if flush_now {
            self.schedule_flush();
        }
        Some(entry)
    }

    /// Record an event and wait until it is on disk.
    pub async fn log_event_durable(
        &self,
        event: AuditEvent,
    ) -> Result<Option<AuditLogEntry>, AuditWriteFailure> {
        let entry = self.log_event(event);
        if entry.is_some() {
            self.flush().await?;
        }
        Ok(entry)
    }

    /// Write every buffered entry to the active segment.
    ///
    /// Returns the number of entries persisted. On failure the batch stays
    /// queued ahead of newer entries; once `max_write_retries` attempts have
    /// failed the queue is dropped, the chain head falls back to the last
    /// persisted entry and a `Critical` `audit_write_failure` entry is
    /// buffered in its place.
    pub async fn flush(&self) -> Result<usize, AuditWriteFailure> {
        let _gate = self.inner.flush_gate.lock().await;
        let Some(batch) = self.take_batch() else {
            return Ok(0);
        };

        let policy = self.policy();
        let timeout = policy.flush_timeout;
        let dir = self.inner.dir.clone();
        let lines = batch.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = abandoned.clone();
        let mut write =
            tokio::task::spawn_blocking(move || write_segment(&dir, &policy, &lines, &flag));

        let outcome = match tokio::time::timeout(timeout, &mut write).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
            Ok(Err(e)) => Err(format!("audit writer task failed: {}", e)),
            Err(_) => {
                // A writer still waiting for the lock stops without writing.
                abandoned.store(true, Ordering::Release);
                match write.await {
                    Ok(Ok(())) => Ok(()),
                    _ => Err(format!("audit flush timed out after {:?}", timeout)),
                }
            }
        };
        self.settle(batch, outcome)
    }

    /// Synchronous flush for callers without a Tokio runtime.
    pub fn flush_blocking(&self) -> Result<usize, AuditWriteFailure> {
        let _gate = self.inner.flush_gate.blocking_lock();
        let Some(batch) = self.take_batch() else {
            return Ok(0);
        };
        let outcome = write_segment(
            &self.inner.dir,
            &self.policy(),
            &batch,
            &AtomicBool::new(false),
        )
        .map_err(|e| format!("{:#}", e));
        self.settle(batch, outcome)
    }

    /// Query persisted entries with `start <= timestamp <= end`.
    pub fn read_logs(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> AuditQuery {
        AuditQuery {
            dir: self.inner.dir.clone(),
            start,
            end,
        }
    }

    /// Whether the persisted chain is intact up to `end`.
    pub fn verify_integrity(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> bool {
        let report = self.integrity_report(start, end);
        if !report.valid {
            warn!(
                "Audit chain broken at entry {}: {}",
                report.first_break.unwrap_or_default(),
                report.reason.as_deref().unwrap_or("unknown")
            );
        }
        report.valid
    }

    /// Walk the persisted chain from the oldest retained entry up to `end`.
    ///
    /// A break before `start` still invalidates the range, since every later
    /// hash depends on it. The oldest retained entry may link to a segment
    /// removed by retention, so its `previous_hash` is not checked.
    pub fn integrity_report(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> IntegrityReport {
        verify_chain(&self.inner.dir, start, end)
    }

    fn chain(&self) -> MutexGuard<'_, ChainState> {
        self.inner.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule_flush(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let logger = self.clone();
                handle.spawn(async move {
                    let _ = logger.flush().await;
                });
            }
            Err(_) => {
                let _ = self.flush_blocking();
            }
        }
    }

    fn take_batch(&self) -> Option<Vec<PendingLine>> {
        let mut chain = self.chain();
        if chain.pending.is_empty() {
            return None;
        }
        Some(chain.pending.drain(..).collect())
    }

    fn settle(
        &self,
        batch: Vec<PendingLine>,
        outcome: std::result::Result<(), String>,
    ) -> Result<usize, AuditWriteFailure> {
        let max_retries = self.policy().max_write_retries.max(1);
        let mut chain = self.chain();

        let message = match outcome {
            Ok(()) => {
                if let Some(last) = batch.last() {
                    chain.persisted = last.hash.clone();
                }
                chain.failed_attempts = 0;
                debug!("Flushed {} audit entries", batch.len());
                return Ok(batch.len());
            }
            Err(message) => message,
        };

        chain.failed_attempts += 1;
        let attempts = chain.failed_attempts;

        if attempts < max_retries {
            for line in batch.into_iter().rev() {
                chain.pending.push_front(line);
            }
            warn!(
                "Audit flush failed (attempt {}/{}): {}",
                attempts, max_retries, message
            );
            let _ = self.inner.notices.send(AuditNotice::WriteFailed {
                attempt: attempts,
                pending: chain.pending.len(),
                error: message.clone(),
            });
        } else {
            // Newer buffered entries chain off the failed batch, so they go too.
            let dropped = batch.len() + chain.pending.len();
            chain.pending.clear();
            chain.head = chain.persisted.clone();
            chain.failed_attempts = 0;
            error!(
                "Audit flush failed {} times; dropped {} entries: {}",
                attempts, dropped, message
            );

            let failure = AuditEvent::new("audit_write_failure")
                .severity(Severity::Critical)
                .source("audit")
                .result(AuditResult::Failure)
                .details(AuditDetails::WriteFailure {
                    attempts,
                    dropped_entries: dropped,
                    error: message.clone(),
                });
            match seal_line(failure, chain.head.clone(), None) {
                Ok((entry, line)) => {
                    chain.head = entry.hash.clone();
                    chain.pending.push_back(PendingLine {
                        hash: entry.hash,
                        line,
                    });
                }
                Err(e) => error!("Failed to serialize audit failure entry: {}", e),
            }

            let _ = self.inner.notices.send(AuditNotice::BatchDropped {
                dropped,
                error: message.clone(),
            });
        }

        Err(AuditWriteFailure { attempts, message })
    }
}

fn seal_line(
    event: AuditEvent,
    previous_hash: String,
    stack_trace: Option<String>,
) -> serde_json::Result<(AuditLogEntry, String)> {
    let entry = AuditLogEntry::seal(event, previous_hash, stack_trace)?;
    let line = serde_json::to_string(&entry)?;
    Ok((entry, line))
}

fn in_range(entry: &AuditLogEntry, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    start.is_none_or(|s| entry.timestamp >= s) && end.is_none_or(|e| entry.timestamp <= e)
}

/// Find the chain head on disk, writing a `chain_recovery` entry if the
/// last line is corrupted or its `hash` does not match its content.
fn resume_chain(dir: &Path, policy: &AuditPolicy) -> Result<String> {
    let Some(last) = last_line(dir)? else {
        return Ok(GENESIS_HASH.to_string());
    };
    if let Ok(entry) = serde_json::from_str::<AuditLogEntry>(&last)
        && is_sealed(&entry)
    {
        return Ok(entry.hash);
    }

    warn!(
        "Last audit entry in {} is corrupted; starting a new chain segment",
        dir.display()
    );
    let recovery = AuditEvent::new("chain_recovery")
        .severity(Severity::Warning)
        .source("audit")
        .result(AuditResult::Failure)
        .details(AuditDetails::Integrity {
            target: ACTIVE_SEGMENT.to_string(),
            detail: format!(
                "Previous entry corrupted ({} bytes), new chain segment",
                last.len()
            ),
        });
    let (entry, line) = seal_line(recovery, sha256_hex(last.as_bytes()), None)
        .context("Failed to serialize recovery entry")?;
    write_segment(
        dir,
        policy,
        &[PendingLine {
            hash: entry.hash.clone(),
            line,
        }],
        &AtomicBool::new(false),
    )?;
    Ok(entry.hash)
}

/// Whether `hash` is a well-formed SHA-256 digest of the entry's content.
fn is_sealed(entry: &AuditLogEntry) -> bool {
    entry.hash.len() == 64
        && entry
            .hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        && entry.compute_hash().ok().as_deref() == Some(entry.hash.as_str())
}

fn verify_chain(
    dir: &Path,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> IntegrityReport {
    let lines = match read_all_lines(dir) {
        Ok(lines) => lines,
        Err(e) => return IntegrityReport::broken(0, 0, format!("unreadable log: {:#}", e)),
    };

    let mut previous: Option<String> = None;
    let mut checked = 0;

    for (index, raw) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditLogEntry>(raw) else {
            return IntegrityReport::broken(index, checked, "unparseable entry");
        };
        if end.is_some_and(|e| entry.timestamp > e) {
            break;
        }
        if let Some(expected) = &previous
            && &entry.previous_hash != expected
        {
            return IntegrityReport::broken(index, checked, "previous_hash does not match");
        }
        if entry.compute_hash().ok().as_deref() != Some(entry.hash.as_str()) {
            return IntegrityReport::broken(index, checked, "entry hash does not match content");
        }
        if start.is_none_or(|s| entry.timestamp >= s) {
            checked += 1;
        }
        previous = Some(entry.hash);
    }

    IntegrityReport {
        valid: true,
        checked,
        first_break: None,
        reason: None,
    }
}

/// Append `batch` to the active segment under the directory lock.
///
/// Nothing is written once `abandoned` is set before the lock is taken.
/// Lines already present on disk are skipped by matching the last persisted
/// hash against the batch.
fn write_segment(
    dir: &Path,
    policy: &AuditPolicy,
    batch: &[PendingLine],
    abandoned: &AtomicBool,
) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;
    let lock = FileLock::new(dir.join(LOCK_FILENAME))?;
    let _guard = acquire_unless_abandoned(&lock, abandoned)?;

    let skip = last_line(dir)?
        .and_then(|line| serde_json::from_str::<AuditLogEntry>(&line).ok())
        .and_then(|last| batch.iter().position(|p| p.hash == last.hash))
        .map_or(0, |i| i + 1);
    let lines = &batch[skip..];
    if lines.is_empty() {
        return Ok(());
    }

    rotate_if_needed(dir, policy)?;

    let path = dir.join(ACTIVE_SEGMENT);
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut buf = String::new();
    for pending in lines {
        buf.push_str(&pending.line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())
        .context("Failed to write audit entries")?;
    file.sync_data().context("Failed to sync audit log")?;
    Ok(())
}

fn acquire_unless_abandoned(lock: &FileLock, abandoned: &AtomicBool) -> Result<FileLockGuard> {
    loop {
        if abandoned.load(Ordering::Acquire) {
            anyhow::bail!("audit write abandoned while waiting for {}", lock.path().display());
        }
        if let Some(guard) = lock.try_acquire()? {
            if abandoned.load(Ordering::Acquire) {
                anyhow::bail!("audit write abandoned");
            }
            return Ok(guard);
        }
        std::thread::sleep(LOCK_POLL);
    }
}

struct Segment {
    seq: u64,
    path: PathBuf,
}

fn rotate_if_needed(dir: &Path, policy: &AuditPolicy) -> Result<()> {
    if policy.max_segment_bytes == 0 {
        return Ok(());
    }
    let active = dir.join(ACTIVE_SEGMENT);
    let Ok(meta) = fs::metadata(&active) else {
        return Ok(());
    };
    if meta.len() < policy.max_segment_bytes {
        return Ok(());
    }

    let seq = list_segments(dir)?.last().map_or(1, |s| s.seq + 1);
    let name = format!(
        "{}{}-{:06}{}",
        SEGMENT_PREFIX,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        seq,
        SEGMENT_SUFFIX
    );
    fs::rename(&active, dir.join(&name))
        .with_context(|| format!("Failed to rotate audit segment to {}", name))?;
    info!("Rotated audit segment to {}", name);

    let segments = list_segments(dir)?;
    if segments.len() > policy.retention_segments {
        let excess = segments.len() - policy.retention_segments;
        for old in &segments[..excess] {
            fs::remove_file(&old.path)
                .with_context(|| format!("Failed to remove {}", old.path.display()))?;
            info!("Removed expired audit segment {}", old.path.display());
        }
    }
    Ok(())
}

/// Rotated segments, oldest first.
fn list_segments(dir: &Path) -> Result<Vec<Segment>> {
    let pattern = format!(
        "{}/{}*{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        SEGMENT_PREFIX,
        SEGMENT_SUFFIX
    );
    let mut segments: Vec<Segment> = glob::glob(&pattern)
        .context("Invalid audit segment pattern")?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
            let seq = stem.rsplit('-').next()?.parse().ok()?;
            Some(Segment { seq, path })
        })
        .collect();
    segments.sort_by_key(|s| s.seq);
    Ok(segments)
}

/// Every segment in chain order: rotated segments, then the active one.
fn segment_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = list_segments(dir)?.into_iter().map(|s| s.path).collect();
    let active = dir.join(ACTIVE_SEGMENT);
    if active.is_file() {
        paths.push(active);
    }
    Ok(paths)
}

fn read_all_lines(dir: &Path) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for path in segment_paths(dir)? {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        lines.extend(
            content
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
    Ok(lines)
}

/// Last non-empty line of the newest non-empty segment.
fn last_line(dir: &Path) -> Result<Option<String>> {
    for path in segment_paths(dir)?.iter().rev() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if let Some(line) = content.lines().rev().find(|l| !l.is_empty()) {
            return Ok(Some(line.to_string()));
        }
    }
    Ok(None)
}

/// Compute hex-encoded SHA-256.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
