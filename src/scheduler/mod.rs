//! Cron-driven enqueuer. Holds the set of [`ScheduledEntry`]
//! records, arms one timer task per enabled entry on [`Scheduler::start`],
//! and fires into the target queue's [`crate::queue::Queue::enqueue`] under
//! a process-wide `maxConcurrentJobs` gate. A `cron::Schedule` computes the
//! next fire time, a `tokio::select!` races that sleep against shutdown.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use autoweave_graceful_shutdown::GracefulShutdownConsumer;

use crate::config::SchedulerSettings;
use crate::error::{Error, ValidationError};
use crate::job::{JobMetadata, JobSource, JobSubmission};
use crate::queue::Queue;
use crate::redis_keys::SCHEDULED_ENTRIES_KEY;

/// A registered recurring firing. Canonical state lives in the
/// `sched:entries` hash; the scheduler's in-memory cache is rebuilt from it
/// on [`Scheduler::start`] per the "in-memory caches must be rebuildable
/// from Redis" design note.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScheduledEntry {
    pub id: String,
    pub cron: String,
    pub target_queue: String,
    pub template: JobSubmission,
    pub enabled: bool,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub next_run: Option<DateTime<Utc>>,
}

/// Input to [`Scheduler::schedule_job`]. `id` is caller-supplied and stable,
/// identifying the entry across restarts.
pub struct ScheduledEntryInput {
    pub id: String,
    pub cron: String,
    pub target_queue: String,
    pub template: JobSubmission,
    pub enabled: bool,
}

/// Parses and validates a cron expression, returning its next upcoming fire
/// time in UTC. Split out as a free function so registration-time
/// validation (invalid cron expressions are rejected at registration, not
/// at start) is testable without a live scheduler.
fn compute_next_run(cron_expr: &str) -> Result<Option<DateTime<Utc>>, Error> {
    let schedule = cron::Schedule::from_str(cron_expr).map_err(|e| ValidationError::InvalidCron {
        expr: cron_expr.to_string(),
        reason: e.to_string(),
    })?;
    Ok(schedule.upcoming(Utc).next())
}

struct EntryHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

struct SchedulerInner {
    pool: autoweave_database::RedisPool,
    queues: HashMap<String, Queue>,
    settings: SchedulerSettings,
    shutdown: GracefulShutdownConsumer,
    concurrency: Arc<Semaphore>,
    entries: Mutex<HashMap<String, ScheduledEntry>>,
    tasks: Mutex<HashMap<String, EntryHandle>>,
}

/// Cheaply cloneable handle to the scheduler. Every clone shares the same
/// entry cache and background timer tasks.
#[derive(Clone)]
pub struct Scheduler(Arc<SchedulerInner>);

impl Scheduler {
    pub fn new(
        pool: autoweave_database::RedisPool,
        queues: HashMap<String, Queue>,
        settings: SchedulerSettings,
        shutdown: GracefulShutdownConsumer,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1) as usize));
        Scheduler(Arc::new(SchedulerInner {
            pool,
            queues,
            settings,
            shutdown,
            concurrency,
            entries: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }))
    }

    pub fn entries(&self) -> Vec<ScheduledEntry> {
        self.0.entries.lock().unwrap().values().cloned().collect()
    }

    pub fn entry(&self, id: &str) -> Option<ScheduledEntry> {
        self.0.entries.lock().unwrap().get(id).cloned()
    }

    /// Rebuilds the entry cache from `sched:entries` and arms a timer task
    /// for every enabled entry with a valid upcoming fire time.
    pub async fn start(&self) -> Result<(), Error> {
        for entry in self.load_entries().await? {
            let id = entry.id.clone();
            let spawn = entry.enabled && entry.next_run.is_some();
            self.0.entries.lock().unwrap().insert(id.clone(), entry);
            if spawn {
                self.spawn_entry_task(id);
            }
        }
        Ok(())
    }

    fn entries_key(&self) -> String {
        self.0.pool.key(SCHEDULED_ENTRIES_KEY)
    }

    async fn load_entries(&self) -> Result<Vec<ScheduledEntry>, Error> {
        let mut conn = self.0.pool.get().await?;
        let raw: Vec<String> = redis::cmd("HGETALL")
            .arg(self.entries_key())
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::new();
        for chunk in raw.chunks(2) {
            let (Some(id), Some(json)) = (chunk.first(), chunk.get(1)) else { continue };
            match serde_json::from_str::<ScheduledEntry>(json) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    event!(Level::ERROR, entry = %id, %error, "failed to deserialize scheduled entry, skipping");
                }
            }
        }
        Ok(entries)
    }

    async fn persist_entry(&self, entry: &ScheduledEntry) -> Result<(), Error> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.0.pool.get().await?;
        redis::cmd("HSET")
            .arg(self.entries_key())
            .arg(&entry.id)
            .arg(&json)
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.0.entries.lock().unwrap().insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    /// Registers a new recurring firing. Rejects a duplicate id, an unknown
    /// target queue, or an invalid cron expression before anything is
    /// written to Redis.
    pub async fn schedule_job(&self, input: ScheduledEntryInput) -> Result<(), Error> {
        if self.0.entries.lock().unwrap().contains_key(&input.id) {
            return Err(ValidationError::DuplicateScheduledEntry(input.id).into());
        }
        if !self.0.queues.contains_key(&input.target_queue) {
            return Err(ValidationError::UnknownQueue(input.target_queue).into());
        }
        let next_run = compute_next_run(&input.cron)?;

        let entry = ScheduledEntry {
            id: input.id,
            cron: input.cron,
            target_queue: input.target_queue,
            template: input.template,
            enabled: input.enabled,
            run_count: 0,
            failure_count: 0,
            last_run: None,
            next_run,
        };
        self.persist_entry(&entry).await?;
        event!(Level::INFO, entry = %entry.id, cron = %entry.cron, "scheduled entry registered");

        if entry.enabled && entry.next_run.is_some() {
            self.spawn_entry_task(entry.id);
        }
        Ok(())
    }

    /// Removes a scheduled entry and stops its timer task, if any. The task
    /// is signaled to stop and its completion awaited in the background,
    /// matching the worker pool's drain-then-detach pattern.
    pub async fn unschedule_job(&self, id: &str) -> Result<(), Error> {
        {
            let mut entries = self.0.entries.lock().unwrap();
            if entries.remove(id).is_none() {
                return Err(ValidationError::UnknownScheduledEntry(id.to_string()).into());
            }
        }
        let mut conn = self.0.pool.get().await?;
        redis::cmd("HDEL")
            .arg(self.entries_key())
            .arg(id)
            .query_async::<_, ()>(&mut conn)
            .await?;

        if let Some(handle) = self.0.tasks.lock().unwrap().remove(id) {
            let _ = handle.stop.send(true);
            tokio::spawn(async move {
                let _ = handle.join.await;
            });
        }
        event!(Level::INFO, entry = %id, "scheduled entry removed");
        Ok(())
    }

    /// Fires an entry immediately, bypassing its timer but still subject to
    /// `maxConcurrentJobs`. Returns `false` (not an error) when the firing
    /// was skipped due to the concurrency gate.
    pub async fn run_job_now(&self, id: &str) -> Result<bool, Error> {
        if !self.0.entries.lock().unwrap().contains_key(id) {
            return Err(ValidationError::UnknownScheduledEntry(id.to_string()).into());
        }
        self.fire_entry(id).await
    }

    fn spawn_entry_task(&self, id: String) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let scheduler = self.clone();
        let mut shutdown = self.0.shutdown.clone();

        let join = tokio::spawn(async move {
            loop {
                let next_run = scheduler.0.entries.lock().unwrap().get(&id).and_then(|e| e.next_run);
                let Some(next_run) = next_run else { break };
                let sleep_for = (next_run - Utc::now()).to_std().unwrap_or(Duration::from_millis(0));

                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                if *stop_rx.borrow() {
                    break;
                }

                if let Err(error) = scheduler.fire_entry(&id).await {
                    event!(Level::ERROR, entry = %id, %error, "scheduled entry firing errored");
                }
            }
        });

        self.0.tasks.lock().unwrap().insert(id, EntryHandle { stop: stop_tx, join });
    }

    /// Core firing logic shared by the timer loop and `run_job_now`: gate on
    /// `maxConcurrentJobs`, enqueue into the target queue with
    /// scheduled-sourced metadata, update run/failure counters, and re-gate
    /// the retry firing exactly like any other firing instead of bypassing
    /// the semaphore.
    async fn fire_entry(&self, id: &str) -> Result<bool, Error> {
        let permit = match self.0.concurrency.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                event!(Level::WARN, entry = %id, "scheduled firing skipped: max concurrent jobs reached");
                return Ok(false);
            }
        };

        let Some(mut entry) = self.entry(id) else { return Ok(false) };
        let Some(queue) = self.0.queues.get(&entry.target_queue).cloned() else {
            return Err(ValidationError::UnknownQueue(entry.target_queue.clone()).into());
        };

        let mut submission = entry.template.clone();
        let correlation_id = format!("{}-{}", entry.id, Utc::now().timestamp_millis());
        let mut metadata = submission
            .options
            .metadata
            .take()
            .unwrap_or_else(|| JobMetadata::new(JobSource::Scheduled));
        metadata.source = JobSource::Scheduled;
        submission.options.metadata = Some(metadata.with_correlation_id(correlation_id));
        submission.options.id = None;

        let result = queue.enqueue(submission).await;
        drop(permit);

        match result {
            Ok(job_id) => {
                entry.run_count += 1;
                entry.last_run = Some(Utc::now());
                entry.next_run = compute_next_run(&entry.cron)?;
                self.persist_entry(&entry).await?;
                event!(Level::DEBUG, entry = %id, job_id = %job_id, "scheduled firing enqueued");
                Ok(true)
            }
            Err(error) => {
                entry.failure_count += 1;
                entry.next_run = compute_next_run(&entry.cron)?;
                let should_retry = self.0.settings.retry_failed_jobs && entry.failure_count <= 3;
                self.persist_entry(&entry).await?;
                event!(Level::WARN, entry = %id, %error, "scheduled firing failed");

                if should_retry {
                    let scheduler = self.clone();
                    let id = id.to_string();
                    let delay = self.0.settings.retry_delay();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(error) = scheduler.fire_entry(&id).await {
                            event!(Level::ERROR, entry = %id, %error, "scheduled retry firing errored");
                        }
                    });
                }
                Err(error)
            }
        }
    }

    /// Signals every entry timer to stop and awaits their completion —
    /// unlike the worker pool, a cron task has no in-flight job to finish,
    /// so shutdown always completes quickly.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.0.tasks.lock().unwrap());
        for handle in tasks.values() {
            let _ = handle.stop.send(true);
        }
        for (_, handle) in tasks {
            let _ = handle.join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_cron_expression_has_an_upcoming_run() {
        let next = compute_next_run("0 * * * * * *").unwrap();
        assert!(next.is_some());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let err = compute_next_run("not a cron expression").unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidCron { .. })));
    }
}
