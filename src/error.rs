use thiserror::Error;

/// Errors raised at submission time. These never reach Redis — a job that
/// fails validation was never written anywhere.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("unknown job kind {0:?}: no processor is registered for it")]
    UnknownKind(crate::job::JobKind),

    #[error("payload for {kind:?} is invalid: {reason}")]
    InvalidPayload { kind: crate::job::JobKind, reason: String },

    #[error("queue {0:?} already exists")]
    DuplicateQueue(String),

    #[error("queue {0:?} is not registered")]
    UnknownQueue(String),

    #[error("scheduled entry {0:?} already exists")]
    DuplicateScheduledEntry(String),

    #[error("scheduled entry {0:?} is not registered")]
    UnknownScheduledEntry(String),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Pool(#[from] autoweave_database::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("job record {id} has unsupported schema version {found:?} (expected major {expected_major})")]
    UnknownSchemaVersion {
        id: String,
        found: String,
        expected_major: u32,
    },

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("processor error: {0}")]
    Processor(#[from] anyhow::Error),

    #[error("processor for {0:?} timed out")]
    ProcessorTimeout(crate::job::JobKind),

    #[error("shut down while waiting for {0}")]
    ShuttingDown(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
