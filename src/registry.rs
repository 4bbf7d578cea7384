//! Process-wide mapping from [`JobKind`] to the processor function that
//! handles it, plus the composable decorators
//! (`with_logging`/`with_retry`/`with_timeout`) the worker pool wraps
//! around a registered processor.
//!
//! Because [`JobKind`] is a closed enum rather than a runtime string, a
//! kind that has no registered processor is rejected by
//! [`crate::manager::QueueManager::submit`] at submission time — the
//! registry itself never has to invent a "missing handler" runtime error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{event, Level};

use crate::job::{JobKind, JobRecord};
use crate::queue::Queue;

/// A one-shot cooperative cancellation signal, the same `watch`-channel
/// shape as [`autoweave_graceful_shutdown::GracefulShutdown`] but scoped to
/// a single job instead of the whole process.
#[derive(Clone)]
pub struct CancellationToken(watch::Receiver<bool>);

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation has been signaled. A processor that
    /// never polls this simply ignores the signal — such a job is
    /// eventually reclaimed as stalled instead.
    pub async fn cancelled(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct CancellationSource(watch::Sender<bool>);

impl CancellationSource {
    pub fn new() -> (CancellationSource, CancellationToken) {
        let (tx, rx) = watch::channel(false);
        (CancellationSource(tx), CancellationToken(rx))
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Context handed to a processor on invocation: the job's data, a way to
/// report progress, a way to log against the job record, a worker-local
/// start timestamp, and a cancellation signal.
#[derive(Clone)]
pub struct JobContext {
    job: JobRecord,
    queue: Queue,
    cancel: CancellationToken,
    started_at: Instant,
}

impl JobContext {
    pub fn new(job: JobRecord, queue: Queue, cancel: CancellationToken) -> Self {
        JobContext { job, queue, cancel, started_at: Instant::now() }
    }

    pub fn data(&self) -> &JobRecord {
        &self.job
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind()
    }

    pub async fn progress(&self, percent: u8, detail: Option<serde_json::Value>) -> Result<(), crate::error::Error> {
        self.queue.update_progress(&self.job.id, percent, detail).await
    }

    /// Logs against the job's own record so a later inspection of
    /// `Q:<name>:job:<id>` carries processor-emitted breadcrumbs, not just
    /// `tracing` output. Best-effort: a logging failure is surfaced via
    /// `tracing` rather than failing the job.
    pub fn log(&self, level: crate::job::LogLevel, message: impl Into<String>) {
        let message = message.into();
        event!(Level::DEBUG, job_id = %self.job.id, %message, "processor log");
        let queue = self.queue.clone();
        let job_id = self.job.id.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.append_log(&job_id, level, message).await {
                event!(Level::WARN, job_id = %job_id, error = %e, "failed to persist processor log entry");
            }
        });
    }

    pub fn timestamp(&self) -> Instant {
        self.started_at
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What a processor returns on success. `data` becomes the job's `result`.
#[derive(Debug, Default, Clone)]
pub struct ProcessorOutcome {
    pub data: Option<serde_json::Value>,
}

impl ProcessorOutcome {
    pub fn empty() -> Self {
        ProcessorOutcome::default()
    }

    pub fn with_data(data: serde_json::Value) -> Self {
        ProcessorOutcome { data: Some(data) }
    }
}

pub type ProcessorResult = Result<ProcessorOutcome, anyhow::Error>;

/// A processor: an async function from job context to outcome. Boxed as a
/// trait object so the registry can hold heterogeneous processors (and
/// decorators can wrap one processor to produce another) behind one type.
pub type Processor = Arc<dyn Fn(JobContext) -> BoxFuture<'static, ProcessorResult> + Send + Sync>;

pub fn processor_fn<F, Fut>(f: F) -> Processor
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ProcessorResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Trait-based alternative to [`processor_fn`], for processors that are
/// structs carrying their own shared state (a database pool, an HTTP
/// client) rather than a bare closure — the same shape as the reference
/// codebase's `QueueJobProcessor` trait, which collaborating subsystems
/// (the plugin loader, the LLM batcher) are expected to implement.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> ProcessorResult;
}

/// Adapts a [`JobProcessor`] into the boxed-closure [`Processor`] shape the
/// registry actually stores, so decorators compose over it the same way.
pub fn processor_from_trait(processor: Arc<dyn JobProcessor>) -> Processor {
    Arc::new(move |ctx: JobContext| {
        let processor = processor.clone();
        Box::pin(async move { processor.process(ctx).await })
    })
}

/// Wraps a processor with start/stop timing logged via `tracing`.
pub fn with_logging(inner: Processor) -> Processor {
    Arc::new(move |ctx: JobContext| {
        let inner = inner.clone();
        Box::pin(async move {
            let kind = ctx.kind();
            let job_id = ctx.data().id.clone();
            let start = Instant::now();
            event!(Level::INFO, %kind, job_id = %job_id, "processor starting");
            let result = inner(ctx).await;
            let elapsed_ms = start.elapsed().as_millis();
            match &result {
                Ok(_) => event!(Level::INFO, %kind, job_id = %job_id, elapsed_ms, "processor finished"),
                Err(error) => event!(Level::WARN, %kind, job_id = %job_id, elapsed_ms, %error, "processor errored"),
            }
            result
        })
    })
}

/// In-processor retry, distinct from the queue-level retry/backoff: this
/// retries within a single claimed attempt and never touches the job's
/// persisted `attempts` counter.
pub fn with_retry(inner: Processor, max_attempts: u32) -> Processor {
    let max_attempts = max_attempts.max(1);
    Arc::new(move |ctx: JobContext| {
        let inner = inner.clone();
        Box::pin(async move {
            let mut last_error = None;
            for attempt in 1..=max_attempts {
                if ctx.is_cancelled() {
                    break;
                }
                match inner(ctx.clone()).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(error) => {
                        event!(Level::WARN, attempt, max_attempts, %error, "in-processor retry");
                        last_error = Some(error);
                    }
                }
            }
            Err(last_error.unwrap_or_else(|| anyhow::anyhow!("processor retried zero times")))
        })
    })
}

/// Races the processor against a timer; a processor that doesn't finish in
/// time is reported as an error (the worker pool separately tracks this as
/// a timeout for metrics, since this wrapper alone can't distinguish "slow"
/// from "hung").
pub fn with_timeout(inner: Processor, timeout: Duration) -> Processor {
    Arc::new(move |ctx: JobContext| {
        let inner = inner.clone();
        Box::pin(async move {
            let kind = ctx.kind();
            let job_id = ctx.data().id.clone();
            match tokio::time::timeout(timeout, inner(ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    event!(Level::WARN, %kind, job_id = %job_id, "processor timed out");
                    Err(anyhow::anyhow!("processor for {kind:?} timed out"))
                }
            }
        })
    })
}

/// Process-wide, per-queue table of job-kind to processor. Built once via
/// [`ProcessorRegistryBuilder`] and shared (cheaply cloneable) across every
/// worker in a pool.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: Arc<HashMap<JobKind, Processor>>,
}

#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: HashMap<JobKind, Processor>,
}

impl ProcessorRegistryBuilder {
    pub fn new() -> Self {
        ProcessorRegistryBuilder::default()
    }

    pub fn register(mut self, kind: JobKind, processor: Processor) -> Self {
        self.processors.insert(kind, processor);
        self
    }

    /// Registers a [`JobProcessor`] trait object for `kind`.
    pub fn register_trait(self, kind: JobKind, processor: Arc<dyn JobProcessor>) -> Self {
        self.register(kind, processor_from_trait(processor))
    }

    pub fn build(self) -> ProcessorRegistry {
        ProcessorRegistry { processors: Arc::new(self.processors) }
    }
}

impl ProcessorRegistry {
    pub fn contains(&self, kind: JobKind) -> bool {
        self.processors.contains_key(&kind)
    }

    pub fn get(&self, kind: JobKind) -> Option<&Processor> {
        self.processors.get(&kind)
    }

    /// Looks up the job's kind and invokes the registered processor.
    /// Dispatch failure (no processor for
    /// the kind) should not happen in practice — [`crate::manager::QueueManager::submit`]
    /// already rejected the submission — but a registry built by hand for
    /// tests may still hit it, so it's a runtime error here, not a panic.
    pub async fn dispatch(&self, ctx: JobContext) -> ProcessorResult {
        let kind = ctx.kind();
        match self.processors.get(&kind) {
            Some(processor) => processor(ctx).await,
            None => Err(anyhow::anyhow!("no processor registered for {kind:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobPayload, UsbScanPayload};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_record() -> JobRecord {
        JobRecord::from_submission(
            crate::job::JobSubmission::new(JobPayload::UsbScan(UsbScanPayload { bus: None })),
            chrono::Utc::now(),
        )
    }

    struct EchoProcessor;

    #[async_trait]
    impl JobProcessor for EchoProcessor {
        async fn process(&self, _ctx: JobContext) -> ProcessorResult {
            Ok(ProcessorOutcome::with_data(serde_json::json!({"echoed": true})))
        }
    }

    #[tokio::test]
    async fn trait_processor_dispatches_through_registry() {
        let registry = ProcessorRegistryBuilder::new()
            .register_trait(JobKind::UsbScan, Arc::new(EchoProcessor))
            .build();

        let (_source, token) = CancellationSource::new();
        let pool = autoweave_database::RedisPool::from_url("redis://127.0.0.1:0", None).unwrap();
        let queue = Queue::new(pool, "q", Default::default(), Default::default());
        let ctx = JobContext::new(test_record(), queue, token);

        let outcome = registry.dispatch(ctx).await.unwrap();
        assert_eq!(outcome.data, Some(serde_json::json!({"echoed": true})));
    }

    #[test]
    fn registry_reports_contains() {
        let registry = ProcessorRegistryBuilder::new()
            .register(JobKind::UsbScan, processor_fn(|_ctx| async { Ok(ProcessorOutcome::empty()) }))
            .build();
        assert!(registry.contains(JobKind::UsbScan));
        assert!(!registry.contains(JobKind::UsbAttach));
    }

    #[tokio::test]
    async fn with_retry_stops_on_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let inner = processor_fn(move |_ctx| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ProcessorOutcome::empty())
            }
        });
        let wrapped = with_retry(inner, 3);

        let (_source, token) = CancellationSource::new();
        let pool = autoweave_database::RedisPool::from_url("redis://127.0.0.1:0", None).unwrap();
        let queue = Queue::new(pool, "q", Default::default(), Default::default());
        let ctx = JobContext::new(test_record(), queue, token);

        let result = wrapped(ctx).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_exhausts_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let inner = processor_fn(move |_ctx| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("always fails"))
            }
        });
        let wrapped = with_retry(inner, 3);

        let (_source, token) = CancellationSource::new();
        let pool = autoweave_database::RedisPool::from_url("redis://127.0.0.1:0", None).unwrap();
        let queue = Queue::new(pool, "q", Default::default(), Default::default());
        let ctx = JobContext::new(test_record(), queue, token);

        let result = wrapped(ctx).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_timeout_reports_error_when_exceeded() {
        let inner = processor_fn(|_ctx| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ProcessorOutcome::empty())
        });
        let wrapped = with_timeout(inner, Duration::from_millis(5));

        let (_source, token) = CancellationSource::new();
        let pool = autoweave_database::RedisPool::from_url("redis://127.0.0.1:0", None).unwrap();
        let queue = Queue::new(pool, "q", Default::default(), Default::default());
        let ctx = JobContext::new(test_record(), queue, token);

        let result = wrapped(ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_token_resolves_after_cancel() {
        let (source, mut token) = CancellationSource::new();
        assert!(!token.is_cancelled());
        source.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
