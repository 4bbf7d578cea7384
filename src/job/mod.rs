pub mod payloads;
mod validate;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use payloads::*;
pub use validate::validate_payload;

/// Schema version stamped into every job's metadata. Readers reject records
/// whose major version component they don't understand.
pub const SCHEMA_VERSION: &str = "1.0.0";

fn schema_major(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

pub fn schema_major_supported(version: &str) -> bool {
    schema_major(version) == schema_major(SCHEMA_VERSION)
}

/// Closed enumeration of job categories. Adding a new kind means adding a
/// variant here, a payload type in [`payloads`], and a registry entry —
/// there is no string-keyed escape hatch, so an unregistered kind is a
/// compile error, not a runtime surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    UsbAttach,
    UsbDetach,
    UsbScan,
    PluginLoad,
    PluginUnload,
    PluginExecute,
    PluginValidate,
    PluginReload,
    LlmBatch,
    LlmEmbeddings,
    LlmCompletion,
    SystemMaintenance,
    SystemCleanup,
    SystemHealth,
    SystemBackup,
    MemoryVectorize,
    MemoryIndex,
    MemorySearch,
    MemoryCleanup,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

/// The typed job payload. The `kind` tag is redundant with [`JobPayload::kind`]
/// but kept on the wire (as the serde tag) so a reader can route a record
/// without deserializing the whole variant first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    UsbAttach(UsbAttachPayload),
    UsbDetach(UsbDetachPayload),
    UsbScan(UsbScanPayload),
    PluginLoad(PluginLoadPayload),
    PluginUnload(PluginUnloadPayload),
    PluginExecute(PluginExecutePayload),
    PluginValidate(PluginValidatePayload),
    PluginReload(PluginReloadPayload),
    LlmBatch(LlmBatchPayload),
    LlmEmbeddings(LlmEmbeddingsPayload),
    LlmCompletion(LlmCompletionPayload),
    SystemMaintenance(SystemMaintenancePayload),
    SystemCleanup(SystemCleanupPayload),
    SystemHealth(SystemHealthPayload),
    SystemBackup(SystemBackupPayload),
    MemoryVectorize(MemoryVectorizePayload),
    MemoryIndex(MemoryIndexPayload),
    MemorySearch(MemorySearchPayload),
    MemoryCleanup(MemoryCleanupPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::UsbAttach(_) => JobKind::UsbAttach,
            JobPayload::UsbDetach(_) => JobKind::UsbDetach,
            JobPayload::UsbScan(_) => JobKind::UsbScan,
            JobPayload::PluginLoad(_) => JobKind::PluginLoad,
            JobPayload::PluginUnload(_) => JobKind::PluginUnload,
            JobPayload::PluginExecute(_) => JobKind::PluginExecute,
            JobPayload::PluginValidate(_) => JobKind::PluginValidate,
            JobPayload::PluginReload(_) => JobKind::PluginReload,
            JobPayload::LlmBatch(_) => JobKind::LlmBatch,
            JobPayload::LlmEmbeddings(_) => JobKind::LlmEmbeddings,
            JobPayload::LlmCompletion(_) => JobKind::LlmCompletion,
            JobPayload::SystemMaintenance(_) => JobKind::SystemMaintenance,
            JobPayload::SystemCleanup(_) => JobKind::SystemCleanup,
            JobPayload::SystemHealth(_) => JobKind::SystemHealth,
            JobPayload::SystemBackup(_) => JobKind::SystemBackup,
            JobPayload::MemoryVectorize(_) => JobKind::MemoryVectorize,
            JobPayload::MemoryIndex(_) => JobKind::MemoryIndex,
            JobPayload::MemorySearch(_) => JobKind::MemorySearch,
            JobPayload::MemoryCleanup(_) => JobKind::MemoryCleanup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobSource {
    UsbDaemon,
    PluginLoader,
    Manual,
    Scheduled,
    Webhook,
}

impl std::fmt::Display for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobSource::UsbDaemon => "usb-daemon",
            JobSource::PluginLoader => "plugin-loader",
            JobSource::Manual => "manual",
            JobSource::Scheduled => "scheduled",
            JobSource::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub source: JobSource,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub plugin_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl JobMetadata {
    pub fn new(source: JobSource) -> Self {
        JobMetadata {
            source,
            submitted_at: Utc::now(),
            version: SCHEMA_VERSION.to_string(),
            tenant_id: None,
            plugin_id: None,
            user_id: None,
            trace_id: None,
            span_id: None,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "base_delay_ms")]
pub enum BackoffPolicy {
    Fixed(u64),
    Exponential(u64),
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential(1000)
    }
}

/// Ceiling applied to exponential backoff: delays beyond 30s stop
/// compounding and just retry at the cap.
pub const EXPONENTIAL_BACKOFF_CAP_MS: u64 = 30_000;

impl BackoffPolicy {
    /// Delay before the attempt numbered `attempt` (1-based: the first
    /// retry is `attempt == 2`, i.e. the second attempt overall).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(ms) => Duration::from_millis(*ms),
            BackoffPolicy::Exponential(base_ms) => {
                let exponent = attempt.saturating_sub(1).min(20);
                let scaled = base_ms.saturating_mul(1u64 << exponent);
                Duration::from_millis(scaled.min(EXPONENTIAL_BACKOFF_CAP_MS))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Cancelled,
    DeadLettered,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::DeadLettered
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl Default for Progress {
    fn default() -> Self {
        Progress { percent: 0, detail: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub error_type: String,
    pub attempt: u32,
    /// Truncated identifier for a stack/trace captured out-of-band; previous
    /// attempts are summarized here, not retained verbatim.
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Options accepted at submission time. Everything here has a default:
/// priority clamps into range, delay/backoff/timeout/maxAttempts fall back
/// to the queue's configured defaults when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Option<i32>,
    pub delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub timeout_ms: Option<u64>,
    pub metadata: Option<JobMetadata>,
    /// Caller-supplied id. Left unset, a v4 UUID is assigned.
    pub id: Option<String>,
}

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A job as submitted by a caller, before it has been assigned an id or
/// normalized. [`crate::queue::Queue::enqueue`] turns this into a [`JobRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub payload: JobPayload,
    pub options: JobOptions,
}

impl JobSubmission {
    pub fn new(payload: JobPayload) -> Self {
        JobSubmission { payload, options: JobOptions::default() }
    }

    pub fn with_options(payload: JobPayload, options: JobOptions) -> Self {
        JobSubmission { payload, options }
    }
}

/// The canonical, persisted representation of a job. Every mutation to a
/// job's state flows through [`crate::queue::Queue`], which is the only
/// writer of this record in Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub payload: JobPayload,
    pub metadata: JobMetadata,
    pub priority: i32,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub run_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    #[serde(with = "serde_millis")]
    pub timeout: Duration,
    pub status: JobStatus,
    pub progress: Progress,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

/// Bound on retained log entries per job, so a chatty processor can't grow
/// a job record without limit.
pub const MAX_LOG_ENTRIES: usize = 50;

impl JobRecord {
    pub fn from_submission(submission: JobSubmission, now: DateTime<Utc>) -> Self {
        let JobSubmission { payload, options } = submission;
        let id = options
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let priority = options
            .priority
            .unwrap_or(DEFAULT_PRIORITY)
            .clamp(0, 100);
        let delay_ms = options.delay_ms.unwrap_or(0);
        let run_at = if delay_ms > 0 {
            Some(now + chrono::Duration::milliseconds(delay_ms as i64))
        } else {
            None
        };
        let status = if run_at.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };

        JobRecord {
            id,
            metadata: options.metadata.unwrap_or_else(|| JobMetadata::new(JobSource::Manual)),
            priority,
            run_at,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            backoff: options.backoff.unwrap_or_default(),
            timeout: Duration::from_millis(options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).max(1)),
            status,
            progress: Progress::default(),
            result: None,
            error: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            failed_at: None,
            log: Vec::new(),
            payload,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.log.len() >= MAX_LOG_ENTRIES {
            self.log.remove(0);
        }
        self.log.push(LogEntry { at: Utc::now(), level, message: message.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_clamps_into_range() {
        let below = JobSubmission::with_options(
            JobPayload::UsbScan(UsbScanPayload { bus: None }),
            JobOptions { priority: Some(-1), ..Default::default() },
        );
        let rec = JobRecord::from_submission(below, Utc::now());
        assert_eq!(rec.priority, 0);

        let above = JobSubmission::with_options(
            JobPayload::UsbScan(UsbScanPayload { bus: None }),
            JobOptions { priority: Some(101), ..Default::default() },
        );
        let rec = JobRecord::from_submission(above, Utc::now());
        assert_eq!(rec.priority, 100);
    }

    #[test]
    fn zero_delay_is_same_as_no_delay() {
        let submission = JobSubmission::with_options(
            JobPayload::UsbScan(UsbScanPayload { bus: None }),
            JobOptions { delay_ms: Some(0), ..Default::default() },
        );
        let rec = JobRecord::from_submission(submission, Utc::now());
        assert_eq!(rec.status, JobStatus::Waiting);
        assert!(rec.run_at.is_none());
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential(100);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        let huge = policy.delay_for_attempt(30);
        assert_eq!(huge, Duration::from_millis(EXPONENTIAL_BACKOFF_CAP_MS));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::Fixed(250);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn schema_major_mismatch_detected() {
        assert!(schema_major_supported("1.2.3"));
        assert!(!schema_major_supported("2.0.0"));
    }
}
