//! Per-queue elastic worker pool. Each [`Queue`] created by the
//! [`crate::manager::QueueManager`] gets one [`WorkerPool`]; the pool owns
//! `min..=max` workers, each claiming and running up to `concurrency` jobs
//! at once, and runs the autoscaler and stalled-job recovery loops.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, TimeZone, Utc};
use fxhash::FxHashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use autoweave_graceful_shutdown::GracefulShutdownConsumer;

use crate::config::WorkerPoolSettings;
use crate::error::Error;
use crate::job::JobRecord;
use crate::queue::Queue;
use crate::registry::{CancellationSource, JobContext, ProcessorRegistry};

/// Shared, atomics-only activity counters for one worker, cheap to read
/// from the metrics loop without taking a lock on the worker list.
#[derive(Default)]
pub struct WorkerStats {
    in_flight: AtomicU32,
    last_activity_ms: AtomicI64,
}

impl WorkerStats {
    fn mark_claim(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn mark_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            match Utc.timestamp_millis_opt(ms) {
                chrono::LocalResult::Single(dt) => Some(dt),
                _ => None,
            }
        }
    }
}

/// A point-in-time view of one worker, for [`crate::metrics`].
pub struct WorkerSnapshot {
    pub id: u64,
    pub busy: bool,
    pub in_flight: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

struct WorkerHandle {
    id: u64,
    drain: watch::Sender<bool>,
    stats: Arc<WorkerStats>,
    join: JoinHandle<()>,
}

struct WorkerPoolInner {
    queue: Queue,
    registry: ProcessorRegistry,
    settings: WorkerPoolSettings,
    shutdown: GracefulShutdownConsumer,
    next_worker_id: AtomicU64,
    workers: Mutex<Vec<WorkerHandle>>,
    cancellations: Arc<Mutex<FxHashMap<String, CancellationSource>>>,
    last_scale_up_ms: AtomicI64,
    last_scale_down_ms: AtomicI64,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a queue's elastic worker pool. Cheaply cloneable; every clone
/// shares the same worker list and background tasks.
#[derive(Clone)]
pub struct WorkerPool(Arc<WorkerPoolInner>);

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const AUTOSCALE_TICK: Duration = Duration::from_millis(1_000);

/// Empty-queue and claim-error backoff, same shape as the reference
/// codebase's `Queue::default_backoff`: never gives up (`max_elapsed_time:
/// None`), grows from a fast initial poll up to a capped interval so an idle
/// queue doesn't busy-poll Redis.
fn claim_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(50),
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(2_000),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Perturbs a sleep duration by up to ±25%, so idle workers polling the
/// same queue don't all wake on the same tick.
fn jittered(duration: Duration) -> Duration {
    let factor = 1.0 + (rand::thread_rng().gen::<f64>() - 0.5) * 0.5;
    Duration::from_secs_f64((duration.as_secs_f64() * factor).max(0.0))
}

impl WorkerPool {
    pub fn new(queue: Queue, registry: ProcessorRegistry, shutdown: GracefulShutdownConsumer) -> Self {
        let settings = queue.worker_pool_settings().clone();
        WorkerPool(Arc::new(WorkerPoolInner {
            queue,
            registry,
            settings,
            shutdown,
            next_worker_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
            cancellations: Arc::new(Mutex::new(FxHashMap::default())),
            last_scale_up_ms: AtomicI64::new(0),
            last_scale_down_ms: AtomicI64::new(0),
            background_tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn queue_name(&self) -> &str {
        self.0.queue.name()
    }

    pub fn worker_count(&self) -> usize {
        self.0.workers.lock().unwrap().len()
    }

    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.0
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| WorkerSnapshot {
                id: w.id,
                busy: w.stats.in_flight() > 0,
                in_flight: w.stats.in_flight(),
                last_activity: w.stats.last_activity(),
            })
            .collect()
    }

    /// Spawns `min_workers` workers and arms the autoscale and stalled-job
    /// recovery background loops.
    pub fn start(&self) {
        for _ in 0..self.0.settings.min_workers {
            self.spawn_worker();
        }

        let autoscale_pool = self.clone();
        let mut autoscale_shutdown = self.0.shutdown.clone();
        let autoscale_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(AUTOSCALE_TICK) => {}
                    _ = autoscale_shutdown.wait_for_shutdown() => break,
                }
                if let Err(error) = autoscale_pool.autoscale_tick().await {
                    event!(Level::WARN, queue = %autoscale_pool.queue_name(), %error, "autoscale tick failed");
                }
            }
        });

        let stalled_pool = self.clone();
        let mut stalled_shutdown = self.0.shutdown.clone();
        let stalled_interval = (self.0.settings.stalled_threshold() / 2).max(Duration::from_millis(500));
        let stalled_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(stalled_interval) => {}
                    _ = stalled_shutdown.wait_for_shutdown() => break,
                }
                if let Err(error) = stalled_pool.stalled_recovery_tick().await {
                    event!(Level::WARN, queue = %stalled_pool.queue_name(), %error, "stalled recovery tick failed");
                }
            }
        });

        let mut background = self.0.background_tasks.lock().unwrap();
        background.push(autoscale_task);
        background.push(stalled_task);
    }

    fn spawn_worker(&self) {
        let id = self.0.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (drain_tx, drain_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());

        let queue = self.0.queue.clone();
        let registry = self.0.registry.clone();
        let settings = self.0.settings.clone();
        let shutdown = self.0.shutdown.clone();
        let cancellations = self.0.cancellations.clone();
        let worker_stats = stats.clone();

        let join = tokio::spawn(async move {
            run_worker(id, queue, registry, settings, shutdown, drain_rx, cancellations, worker_stats).await;
        });

        self.0.workers.lock().unwrap().push(WorkerHandle { id, drain: drain_tx, stats, join });
        event!(Level::INFO, queue = %self.queue_name(), worker = id, "worker started");
    }

    async fn autoscale_tick(&self) -> Result<(), Error> {
        if !self.0.settings.autoscale {
            return Ok(());
        }
        let status = self.0.queue.status().await?;
        let backlog = status.waiting + status.delayed;
        let now = Utc::now().timestamp_millis();
        let worker_count = self.worker_count() as u32;

        let decision = scale_decision(
            backlog,
            worker_count,
            &self.0.settings,
            now,
            self.0.last_scale_up_ms.load(Ordering::Relaxed),
            self.0.last_scale_down_ms.load(Ordering::Relaxed),
        );

        match decision {
            ScaleDecision::Up => {
                self.spawn_worker();
                self.0.last_scale_up_ms.store(now, Ordering::Relaxed);
                event!(Level::INFO, queue = %self.queue_name(), workers = worker_count + 1, backlog, "scaled up");
            }
            ScaleDecision::Down => {
                self.retire_one_worker();
                self.0.last_scale_down_ms.store(now, Ordering::Relaxed);
                event!(Level::INFO, queue = %self.queue_name(), workers = worker_count - 1, backlog, "scaled down");
            }
            ScaleDecision::None => {}
        }

        Ok(())
    }

    /// Pops the most recently added worker and signals it to drain. The
    /// pool's worker count drops immediately (so a following autoscale
    /// tick sees `workers <= max`); the worker itself finishes in-flight
    /// jobs in the background.
    fn retire_one_worker(&self) {
        let handle = self.0.workers.lock().unwrap().pop();
        if let Some(handle) = handle {
            let _ = handle.drain.send(true);
            tokio::spawn(async move {
                let _ = handle.join.await;
            });
        }
    }

    async fn stalled_recovery_tick(&self) -> Result<(), Error> {
        let threshold_ms = self.0.settings.stalled_threshold_ms as i64;
        let now = Utc::now().timestamp_millis();
        for (job_id, heartbeat_ms) in self.0.queue.active_heartbeats().await? {
            if now - heartbeat_ms > threshold_ms {
                self.0.queue.reclaim_stalled(&job_id).await?;
            }
        }
        Ok(())
    }

    /// Signals every worker to cancel a specific in-flight job (in
    /// addition to the Redis-level cancellation [`Queue::cancel_job`]
    /// already performs). A no-op if the job isn't currently claimed by
    /// this pool.
    pub fn signal_cancel(&self, job_id: &str) {
        if let Some(source) = self.0.cancellations.lock().unwrap().get(job_id) {
            source.cancel();
        }
    }

    /// Signals every worker to drain, then awaits their completion up to
    /// `timeout`. Workers still running when the timeout elapses are left
    /// running in the background (their jobs remain `active` in Redis, to
    /// be reclaimed by stalled recovery on the next process).
    pub async fn shutdown(&self, timeout: Duration) {
        let handles = std::mem::take(&mut *self.0.workers.lock().unwrap());
        for handle in &handles {
            let _ = handle.drain.send(true);
        }

        let joins = handles.into_iter().map(|h| h.join);
        let all = futures::future::join_all(joins);
        if tokio::time::timeout(timeout, all).await.is_err() {
            event!(Level::WARN, queue = %self.queue_name(), "worker pool drain timed out; jobs left active");
        }

        let background = std::mem::take(&mut *self.0.background_tasks.lock().unwrap());
        for task in background {
            task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    id: u64,
    queue: Queue,
    registry: ProcessorRegistry,
    settings: WorkerPoolSettings,
    mut shutdown: GracefulShutdownConsumer,
    mut drain_rx: watch::Receiver<bool>,
    cancellations: Arc<Mutex<FxHashMap<String, CancellationSource>>>,
    stats: Arc<WorkerStats>,
) {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1) as usize));
    let mut in_flight = FuturesUnordered::new();
    let mut backoff = claim_backoff();

    loop {
        let draining = *drain_rx.borrow();

        if draining {
            if in_flight.is_empty() {
                break;
            }
            let _ = in_flight.next().await;
            continue;
        }

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tokio::select! {
                    biased;
                    _ = drain_rx.changed() => continue,
                    _ = shutdown.wait_for_shutdown() => break,
                    res = in_flight.next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = res {
                            event!(Level::ERROR, worker = id, error = %e, "job task panicked");
                        }
                        continue;
                    }
                }
            }
        };

        match queue.claim().await {
            Ok(Some(record)) => {
                backoff.reset();
                stats.mark_claim();
                let queue = queue.clone();
                let registry = registry.clone();
                let settings = settings.clone();
                let cancellations = cancellations.clone();
                let stats = stats.clone();
                let task = tokio::spawn(async move {
                    process_claimed_job(&queue, &registry, &settings, record, &cancellations).await;
                    stats.mark_finished();
                    drop(permit);
                });
                in_flight.push(task);
            }
            Ok(None) => {
                drop(permit);
                let sleep_for = jittered(backoff.next_backoff().unwrap_or(POLL_INTERVAL));
                tokio::select! {
                    biased;
                    _ = drain_rx.changed() => {}
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                    res = in_flight.next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = res {
                            event!(Level::ERROR, worker = id, error = %e, "job task panicked");
                        }
                    }
                }
            }
            Err(error) => {
                drop(permit);
                event!(Level::ERROR, worker = id, %error, "claim failed");
                let sleep_for = backoff.next_backoff().unwrap_or(POLL_INTERVAL);
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }
        }
    }

    while let Some(result) = in_flight.next().await {
        if let Err(e) = result {
            event!(Level::ERROR, worker = id, error = %e, "job task panicked during drain");
        }
    }
}

async fn process_claimed_job(
    queue: &Queue,
    registry: &ProcessorRegistry,
    settings: &WorkerPoolSettings,
    record: JobRecord,
    cancellations: &Arc<Mutex<FxHashMap<String, CancellationSource>>>,
) {
    let (cancel_source, cancel_token) = CancellationSource::new();
    cancellations.lock().unwrap().insert(record.id.clone(), cancel_source);

    let heartbeat_queue = queue.clone();
    let heartbeat_job_id = record.id.clone();
    let heartbeat_interval = settings.heartbeat_interval();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_queue.heartbeat(&heartbeat_job_id).await.is_err() {
                break;
            }
        }
    });

    let timeout = record.timeout;
    let ctx = JobContext::new(record.clone(), queue.clone(), cancel_token);
    let outcome = tokio::time::timeout(timeout, registry.dispatch(ctx)).await;

    heartbeat_task.abort();
    cancellations.lock().unwrap().remove(&record.id);

    match outcome {
        Ok(Ok(result)) => {
            if let Err(error) = queue.mark_completed(&record.id, result.data).await {
                event!(Level::ERROR, job_id = %record.id, %error, "failed to mark job completed");
            }
        }
        Ok(Err(error)) => {
            record_failure(queue, &record, error.to_string(), "processor_error").await;
        }
        Err(_elapsed) => {
            record_failure(queue, &record, format!("job exceeded its {}ms timeout", record.timeout.as_millis()), "timeout").await;
        }
    }
}

async fn record_failure(queue: &Queue, record: &JobRecord, message: String, error_type: &'static str) {
    if let Err(error) = queue.mark_failed(&record.id, record, message, error_type).await {
        event!(Level::ERROR, job_id = %record.id, %error, "failed to record job failure");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleDecision {
    None,
    Up,
    Down,
}

/// Pure threshold/cooldown evaluation, split out of [`WorkerPool::autoscale_tick`]
/// so it can be exercised without a live queue or spawned workers. Scale-up
/// and scale-down cooldowns are tracked independently on purpose: a queue
/// that briefly drains below the down-threshold right after scaling up
/// should not be allowed to immediately undo that scale-up, and vice versa.
fn scale_decision(
    backlog: u64,
    worker_count: u32,
    settings: &WorkerPoolSettings,
    now_ms: i64,
    last_scale_up_ms: i64,
    last_scale_down_ms: i64,
) -> ScaleDecision {
    let scale_up_due = now_ms - last_scale_up_ms >= settings.scale_up_cooldown_ms as i64;
    let scale_down_due = now_ms - last_scale_down_ms >= settings.scale_down_cooldown_ms as i64;

    if backlog > settings.scale_up_threshold as u64 && worker_count < settings.max_workers && scale_up_due {
        ScaleDecision::Up
    } else if backlog < settings.scale_down_threshold as u64
        && worker_count > settings.min_workers
        && scale_down_due
    {
        ScaleDecision::Down
    } else {
        ScaleDecision::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WorkerPoolSettings {
        WorkerPoolSettings {
            min_workers: 1,
            max_workers: 5,
            concurrency: 2,
            autoscale: true,
            scale_up_threshold: 10,
            scale_down_threshold: 2,
            scale_up_cooldown_ms: 10_000,
            scale_down_cooldown_ms: 20_000,
            ..WorkerPoolSettings::default()
        }
    }

    #[test]
    fn scales_up_when_backlog_exceeds_threshold_and_cooldown_elapsed() {
        let settings = settings();
        let decision = scale_decision(20, 2, &settings, 100_000, 0, 0);
        assert_eq!(decision, ScaleDecision::Up);
    }

    #[test]
    fn does_not_scale_up_past_max_workers() {
        let settings = settings();
        let decision = scale_decision(20, 5, &settings, 100_000, 0, 0);
        assert_eq!(decision, ScaleDecision::None);
    }

    #[test]
    fn does_not_scale_up_before_cooldown_elapses() {
        let settings = settings();
        let decision = scale_decision(20, 2, &settings, 5_000, 0, 0);
        assert_eq!(decision, ScaleDecision::None);
    }

    #[test]
    fn scales_down_when_backlog_below_threshold_and_cooldown_elapsed() {
        let settings = settings();
        let decision = scale_decision(1, 3, &settings, 100_000, 0, 0);
        assert_eq!(decision, ScaleDecision::Down);
    }

    #[test]
    fn does_not_scale_down_past_min_workers() {
        let settings = settings();
        let decision = scale_decision(1, 1, &settings, 100_000, 0, 0);
        assert_eq!(decision, ScaleDecision::None);
    }

    #[test]
    fn does_not_scale_down_before_cooldown_elapses() {
        let settings = settings();
        let decision = scale_decision(1, 3, &settings, 5_000, 0, 0);
        assert_eq!(decision, ScaleDecision::None);
    }

    #[test]
    fn no_scaling_when_backlog_is_within_the_stable_band() {
        let settings = settings();
        let decision = scale_decision(5, 3, &settings, 100_000, 0, 0);
        assert_eq!(decision, ScaleDecision::None);
    }
}
