pub mod scripts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{event, Level};

use crate::config::WorkerPoolSettings;
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::job::{
    validate_payload, schema_major_supported, JobRecord, JobStatus,
    JobSubmission,
};
use crate::redis_keys::{QueueKeys, TerminalClass};

use self::scripts::{
    AppendLogScript, BulkItem, CancelScript, CleanScript, ClaimScript, CompleteScript,
    EnqueueBulkScript, EnqueueScript, FailScript, FailOutcome, UpdateProgressScript, waiting_score,
};

pub(crate) struct QueueInner {
    pub(crate) pool: autoweave_database::RedisPool,
    pub(crate) name: String,
    pub(crate) keys: QueueKeys,
    pub(crate) job_key_prefix: String,
    pub(crate) worker_pool: WorkerPoolSettings,
    pub(crate) events: EventBus,
    paused_cache: AtomicBool,

    enqueue_script: EnqueueScript,
    enqueue_bulk_script: EnqueueBulkScript,
    claim_script: ClaimScript,
    complete_script: CompleteScript,
    fail_script: FailScript,
    cancel_script: CancelScript,
    update_progress_script: UpdateProgressScript,
    clean_script: CleanScript,
    append_log_script: AppendLogScript,
}

/// A named, independently-configured work queue. The canonical state of
/// every job submitted to it lives in Redis; this type is a thin,
/// cloneable handle over the connection pool and the queue's Lua scripts.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

/// Snapshot returned by [`Queue::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_lettered: u64,
    pub paused: bool,
}

const RETENTION_CAP: usize = 100;

impl Queue {
    pub fn new(
        pool: autoweave_database::RedisPool,
        name: impl Into<String>,
        worker_pool: WorkerPoolSettings,
        events: EventBus,
    ) -> Queue {
        let name = name.into();
        let keys = QueueKeys::new(&name, pool.key_prefix());
        let job_key_prefix = keys.job_prefix();

        Queue(Arc::new(QueueInner {
            pool,
            name,
            keys,
            job_key_prefix,
            worker_pool,
            events,
            paused_cache: AtomicBool::new(false),
            enqueue_script: EnqueueScript::new(),
            enqueue_bulk_script: EnqueueBulkScript::new(),
            claim_script: ClaimScript::new(),
            complete_script: CompleteScript::new(),
            fail_script: FailScript::new(),
            cancel_script: CancelScript::new(),
            update_progress_script: UpdateProgressScript::new(),
            clean_script: CleanScript::new(),
            append_log_script: AppendLogScript::new(),
        }))
    }

    pub(crate) fn inner(&self) -> &QueueInner {
        &self.0
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn worker_pool_settings(&self) -> &WorkerPoolSettings {
        &self.0.worker_pool
    }

    pub fn events(&self) -> &EventBus {
        &self.0.events
    }

    fn scores(record: &JobRecord) -> (f64, f64) {
        let waiting = waiting_score(record.priority, record.created_at.timestamp_millis());
        let due = record
            .run_at
            .map(|t| t.timestamp_millis() as f64)
            .unwrap_or(0.0);
        (waiting, due)
    }

    /// Validates and normalizes a submission, assigning it an id, then
    /// persists it to Redis as `waiting` or `delayed`. Execution parameters
    /// (priority, attempts, timeout) are clamped into range rather than
    /// rejected — see [`JobRecord::from_submission`] — only the payload
    /// shape itself can fail validation.
    pub async fn enqueue(&self, submission: JobSubmission) -> Result<String, Error> {
        validate_payload(&submission.payload)?;

        let record = JobRecord::from_submission(submission, Utc::now());
        let id = record.id.clone();
        let delayed = record.status == JobStatus::Delayed;
        let (waiting_score, due_score) = Self::scores(&record);
        let json = serde_json::to_string(&record)?;

        let mut conn = self.0.pool.get().await?;
        self.0
            .enqueue_script
            .run(self, &mut conn, &id, &json, waiting_score, delayed, due_score)
            .await?;

        event!(Level::DEBUG, queue = %self.0.name, job_id = %id, "job added");
        self.0.events.emit(Event::JobAdded { queue: self.0.name.clone(), job_id: id.clone() });

        Ok(id)
    }

    /// Enqueues every submission, or none: the whole batch is validated
    /// before any Redis write, and the write itself is one Lua invocation.
    pub async fn enqueue_bulk(&self, submissions: Vec<JobSubmission>) -> Result<Vec<String>, Error> {
        if submissions.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(submissions.len());
        for submission in submissions {
            validate_payload(&submission.payload)?;
            records.push(JobRecord::from_submission(submission, Utc::now()));
        }

        let mut items = Vec::with_capacity(records.len());
        let mut jsons = Vec::with_capacity(records.len());
        for record in &records {
            jsons.push(serde_json::to_string(record)?);
        }
        for (record, json) in records.iter().zip(jsons.iter()) {
            let (waiting_score, due_score) = Self::scores(record);
            items.push(BulkItem {
                id: &record.id,
                json: json.clone(),
                waiting_score,
                delayed: record.status == JobStatus::Delayed,
                due_score,
            });
        }

        let mut conn = self.0.pool.get().await?;
        self.0.enqueue_bulk_script.run(self, &mut conn, &items).await?;

        let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
        for id in &ids {
            self.0.events.emit(Event::JobAdded { queue: self.0.name.clone(), job_id: id.clone() });
        }
        Ok(ids)
    }

    pub async fn pause(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        redis::cmd("SET")
            .arg(self.0.keys.pause())
            .arg("1")
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.0.paused_cache.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        redis::cmd("DEL")
            .arg(self.0.keys.pause())
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.0.paused_cache.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, Error> {
        let mut conn = self.0.pool.get().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.0.keys.pause())
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    /// Removes every waiting job without running it. Delayed and active
    /// jobs are untouched.
    pub async fn drain(&self) -> Result<u64, Error> {
        let mut conn = self.0.pool.get().await?;
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.0.keys.waiting())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.cmd("ZREM").arg(self.0.keys.waiting()).arg(&ids).ignore();
        for id in &ids {
            pipe.cmd("DEL").arg(self.0.keys.job(id)).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(ids.len() as u64)
    }

    /// Deletes terminal jobs of the given class older than `grace`, capped
    /// at 100 per call.
    pub async fn clean(&self, grace: std::time::Duration, class: TerminalClass) -> Result<usize, Error> {
        let mut conn = self.0.pool.get().await?;
        let list_key = self.0.keys.terminal(class);
        self.0
            .clean_script
            .run(self, &mut conn, &list_key, grace.as_millis() as i64, RETENTION_CAP)
            .await
    }

    pub async fn status(&self) -> Result<QueueStatus, Error> {
        let mut conn = self.0.pool.get().await?;
        let (waiting, delayed, active, completed, failed, cancelled, dead, paused): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            bool,
        ) = redis::pipe()
            .cmd("ZCARD").arg(self.0.keys.waiting())
            .cmd("ZCARD").arg(self.0.keys.delayed())
            .cmd("HLEN").arg(self.0.keys.active())
            .cmd("LLEN").arg(self.0.keys.completed())
            .cmd("LLEN").arg(self.0.keys.failed())
            .cmd("LLEN").arg(self.0.keys.cancelled())
            .cmd("LLEN").arg(self.0.keys.dead())
            .cmd("EXISTS").arg(self.0.keys.pause())
            .query_async(&mut conn)
            .await?;

        Ok(QueueStatus {
            name: self.0.name.clone(),
            waiting,
            delayed,
            active,
            completed,
            failed,
            cancelled,
            dead_lettered: dead,
            paused,
        })
    }

    /// Fetches and deserializes a job record, rejecting schema versions
    /// this build doesn't understand rather than silently misreading them.
    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, Error> {
        let mut conn = self.0.pool.get().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.0.keys.job(id))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else { return Ok(None) };
        let record: JobRecord = serde_json::from_str(&raw)?;
        if !schema_major_supported(&record.metadata.version) {
            return Err(Error::UnknownSchemaVersion {
                id: id.to_string(),
                found: record.metadata.version.clone(),
                expected_major: crate::job::SCHEMA_VERSION
                    .split('.')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }
        Ok(Some(record))
    }

    /// Claims the next eligible job, if any, atomically materializing any
    /// due delayed jobs first. Used by the worker pool; not part of the
    /// documented external API but public within the crate.
    pub(crate) async fn claim(&self) -> Result<Option<JobRecord>, Error> {
        let mut conn = self.0.pool.get().await?;
        let claimed = self.0.claim_script.run(self, &mut conn).await?;
        match claimed {
            Some((_, json)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn heartbeat(&self, job_id: &str) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        let now = Utc::now().timestamp_millis();
        redis::cmd("HSET")
            .arg(self.0.keys.active())
            .arg(job_id)
            .arg(now)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// All (job id, last heartbeat) pairs currently claimed, for stalled
    /// recovery scans.
    pub(crate) async fn active_heartbeats(&self) -> Result<Vec<(String, i64)>, Error> {
        let mut conn = self.0.pool.get().await?;
        let pairs: Vec<(String, i64)> = redis::cmd("HGETALL")
            .arg(self.0.keys.active())
            .query_async::<_, Vec<String>>(&mut conn)
            .await?
            .chunks(2)
            .filter_map(|chunk| {
                let id = chunk.first()?.clone();
                let hb: i64 = chunk.get(1)?.parse().ok()?;
                Some((id, hb))
            })
            .collect();
        Ok(pairs)
    }

    /// Forcibly reclaims a stalled job through the fail script, the same
    /// path a processor failure takes: the script itself decides, from
    /// `attempts` vs `max_attempts`, whether the job goes back to `waiting`
    /// for another try or is routed to `failed`/dead-lettered. A stall
    /// therefore consumes retry budget exactly like any other failure and
    /// `attempts` can never be bumped past `max_attempts`.
    pub(crate) async fn reclaim_stalled(&self, job_id: &str) -> Result<(), Error> {
        let Some(record) = self.get_job(job_id).await? else { return Ok(()) };
        let next_attempt = record.attempts + 1;
        let error = crate::job::JobError {
            message: "worker heartbeat timed out".to_string(),
            error_type: "stalled".to_string(),
            attempt: next_attempt,
            trace_id: None,
        };
        let error_json = serde_json::to_string(&error)?;

        let mut conn = self.0.pool.get().await?;
        let outcome = self
            .0
            .fail_script
            .run(self, &mut conn, job_id, &error_json, RETENTION_CAP, self.0.worker_pool.dead_letter, 0)
            .await?;

        match &outcome {
            FailOutcome::Retried(_) => {
                event!(Level::WARN, queue = %self.0.name, job_id = %job_id, "job stalled, reclaimed");
                self.0.events.emit(Event::JobStalled { queue: self.0.name.clone(), job_id: job_id.to_string() });
            }
            FailOutcome::Terminal(_) => {
                event!(Level::WARN, queue = %self.0.name, job_id = %job_id, "job stalled, retries exhausted");
                self.0.events.emit(Event::JobStalled { queue: self.0.name.clone(), job_id: job_id.to_string() });
                self.0.events.emit(Event::JobFailed { queue: self.0.name.clone(), job_id: job_id.to_string() });
            }
            FailOutcome::Stale => {}
        }
        Ok(())
    }

    pub(crate) async fn mark_completed(&self, job_id: &str, result: Option<serde_json::Value>) -> Result<bool, Error> {
        let result_json = result.map(|v| serde_json::to_string(&v)).transpose()?;
        let mut conn = self.0.pool.get().await?;
        let marked = self
            .0
            .complete_script
            .run(self, &mut conn, job_id, result_json.as_deref(), RETENTION_CAP)
            .await?;
        if marked {
            event!(Level::DEBUG, queue = %self.0.name, job_id = %job_id, "job completed");
            self.0.events.emit(Event::JobCompleted { queue: self.0.name.clone(), job_id: job_id.to_string() });
        }
        Ok(marked)
    }

    /// Records a processor failure. Computes the retry delay from the
    /// job's backoff policy here (in Rust) and passes it to the script so
    /// the script itself stays policy-agnostic.
    pub(crate) async fn mark_failed(
        &self,
        job_id: &str,
        record: &JobRecord,
        error_message: String,
        error_type: &'static str,
    ) -> Result<FailOutcome, Error> {
        let next_attempt = record.attempts + 1;
        let retry_delay = record.backoff.delay_for_attempt(next_attempt);

        let error = crate::job::JobError {
            message: error_message,
            error_type: error_type.to_string(),
            attempt: next_attempt,
            trace_id: None,
        };
        let error_json = serde_json::to_string(&error)?;

        let mut conn = self.0.pool.get().await?;
        let outcome = self
            .0
            .fail_script
            .run(
                self,
                &mut conn,
                job_id,
                &error_json,
                RETENTION_CAP,
                self.0.worker_pool.dead_letter,
                retry_delay.as_millis() as u64,
            )
            .await?;

        match &outcome {
            FailOutcome::Retried(_) => {
                event!(Level::INFO, queue = %self.0.name, job_id = %job_id, "job failed, retrying");
            }
            FailOutcome::Terminal(_) => {
                event!(Level::WARN, queue = %self.0.name, job_id = %job_id, "job failed permanently");
                self.0.events.emit(Event::JobFailed { queue: self.0.name.clone(), job_id: job_id.to_string() });
            }
            FailOutcome::Stale => {}
        }

        Ok(outcome)
    }

    /// Cancels a job if it hasn't started running yet.
    pub async fn cancel_pending_job(&self, id: &str) -> Result<JobStatus, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0.cancel_script.run(self, &mut conn, id, false).await
    }

    /// Cancels a job, signaling its worker to stop even if it's active.
    pub async fn cancel_job(&self, id: &str) -> Result<JobStatus, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0.cancel_script.run(self, &mut conn, id, true).await
    }

    /// Resets a failed job's error and attempts, returning it to `waiting`.
    pub async fn retry_job(&self, id: &str) -> Result<(), Error> {
        let Some(mut record) = self.get_job(id).await? else {
            return Err(Error::JobNotFound(id.to_string()));
        };
        record.attempts = 0;
        record.error = None;
        record.status = JobStatus::Waiting;
        record.run_at = None;
        let (waiting_score, _) = Self::scores(&record);
        let json = serde_json::to_string(&record)?;

        let mut conn = self.0.pool.get().await?;
        redis::pipe()
            .cmd("SET").arg(self.0.keys.job(id)).arg(&json).ignore()
            .cmd("ZADD").arg(self.0.keys.waiting()).arg(waiting_score).arg(id).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        job_id: &str,
        percent: u8,
        detail: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let detail_json = detail.as_ref().map(serde_json::to_string).transpose()?;
        let mut conn = self.0.pool.get().await?;
        self.0
            .update_progress_script
            .run(self, &mut conn, job_id, percent.min(100), detail_json.as_deref())
            .await?;
        self.0.events.emit(Event::JobProgress {
            queue: self.0.name.clone(),
            job_id: job_id.to_string(),
            progress: crate::job::Progress { percent: percent.min(100), detail },
        });
        Ok(())
    }

    /// Appends a processor-emitted log line to the job record, capped at
    /// [`crate::job::MAX_LOG_ENTRIES`]. Used by [`crate::registry::JobContext::log`].
    pub async fn append_log(&self, job_id: &str, level: crate::job::LogLevel, message: String) -> Result<(), Error> {
        let entry = crate::job::LogEntry { at: Utc::now(), level, message };
        let entry_json = serde_json::to_string(&entry)?;
        let mut conn = self.0.pool.get().await?;
        self.0
            .append_log_script
            .run(self, &mut conn, job_id, &entry_json, crate::job::MAX_LOG_ENTRIES)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_score_orders_priority_before_submission() {
        let high_priority_later = waiting_score(90, 2_000);
        let low_priority_earlier = waiting_score(10, 1_000);
        assert!(high_priority_later < low_priority_earlier, "higher priority must sort first");

        let same_priority_earlier = waiting_score(50, 1_000);
        let same_priority_later = waiting_score(50, 2_000);
        assert!(same_priority_earlier < same_priority_later, "earlier submission sorts first within a class");
    }
}
