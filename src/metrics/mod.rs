//! Metrics and health reporting. Periodically snapshots every queue and
//! worker pool into in-memory aggregates, and answers ad hoc health checks
//! by pinging Redis and inspecting live worker activity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use autoweave_graceful_shutdown::GracefulShutdownConsumer;
use itertools::Itertools;

use crate::config::{HealthSettings, MonitoringSettings};
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::queue::Queue;
use crate::worker_pool::WorkerPool;

/// Exponential moving average with a fixed smoothing factor, used for
/// throughput and latency series that only need a cheap running estimate.
struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    fn new(alpha: f64) -> Self {
        Ema { alpha, value: None }
    }

    fn observe(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        });
    }

    fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Per-queue counters and rates tracked between [`Metrics`] snapshot ticks.
struct QueueAccumulator {
    previous_completed: u64,
    previous_failed: u64,
    throughput_per_sec: Ema,
    error_rate: Ema,
    /// Time from `created_at` to `processed_at` (claim), fed by the
    /// `job:completed`/`job:failed` event stream rather than the poll tick,
    /// since a snapshot alone can't see individual job timestamps.
    avg_wait_ms: Ema,
    /// Time from `processed_at` to `finished_at`.
    avg_processing_ms: Ema,
}

impl QueueAccumulator {
    fn new() -> Self {
        QueueAccumulator {
            previous_completed: 0,
            previous_failed: 0,
            throughput_per_sec: Ema::new(0.3),
            error_rate: Ema::new(0.3),
            avg_wait_ms: Ema::new(0.2),
            avg_processing_ms: Ema::new(0.2),
        }
    }
}

/// Public, point-in-time view of one queue's metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueMetrics {
    pub name: String,
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
    pub avg_wait_ms: f64,
    pub avg_processing_ms: f64,
}

/// Public, point-in-time view of one worker. `memory_kb` is best-effort:
/// read once from `/proc/self/statm` on Linux and shared across every
/// worker snapshot in the same process, since workers are tasks, not OS
/// processes, and per-task RSS isn't something the standard library
/// exposes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerMetrics {
    pub queue: String,
    pub worker_id: u64,
    pub busy: bool,
    pub in_flight: u32,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_activity: Option<DateTime<Utc>>,
    pub memory_kb: Option<u64>,
}

/// Best-effort process RSS in KB, read from `/proc/self/statm`. `None` on
/// any platform or failure rather than treating it as an error.
fn process_memory_kb() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size_kb = 4u64;
    Some(resident_pages * page_size_kb)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub redis_reachable: bool,
    pub queues: Vec<QueueMetrics>,
    pub workers: Vec<WorkerMetrics>,
    pub alerts: Vec<String>,
}

impl HealthReport {
    /// One-line alert summary for a CLI/log line; empty when nothing is
    /// firing.
    pub fn summary(&self) -> String {
        self.alerts.iter().join("; ")
    }
}

struct MetricsInner {
    pool: autoweave_database::RedisPool,
    queues: HashMap<String, Queue>,
    worker_pools: HashMap<String, WorkerPool>,
    monitoring: MonitoringSettings,
    health: HealthSettings,
    events: EventBus,
    shutdown: GracefulShutdownConsumer,
    accumulators: Mutex<HashMap<String, QueueAccumulator>>,
    last_snapshot: Mutex<Option<Vec<QueueMetrics>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to the manager's metrics loop. Like
/// [`crate::scheduler::Scheduler`], the queue/worker-pool set it watches is
/// fixed at construction time; queues created afterwards via
/// [`crate::manager::QueueManager::create_queue`] aren't reflected here.
#[derive(Clone)]
pub struct Metrics(Arc<MetricsInner>);

impl Metrics {
    pub fn new(
        pool: autoweave_database::RedisPool,
        queues: HashMap<String, Queue>,
        worker_pools: HashMap<String, WorkerPool>,
        monitoring: MonitoringSettings,
        health: HealthSettings,
        events: EventBus,
        shutdown: GracefulShutdownConsumer,
    ) -> Self {
        Metrics(Arc::new(MetricsInner {
            pool,
            queues,
            worker_pools,
            monitoring,
            health,
            events,
            shutdown,
            accumulators: Mutex::new(HashMap::new()),
            last_snapshot: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the periodic snapshot loop and the job-duration event
    /// listener, if monitoring is enabled.
    pub fn start(&self) {
        if !self.0.monitoring.enabled {
            return;
        }
        let metrics = self.clone();
        let task = tokio::spawn(async move { metrics.run().await });
        self.0.tasks.lock().unwrap().push(task);

        let durations = self.clone();
        let durations_task = tokio::spawn(async move { durations.run_duration_listener().await });
        self.0.tasks.lock().unwrap().push(durations_task);
    }

    /// Listens for `job:completed`/`job:failed` events and folds each job's
    /// wait/processing duration into its queue's running averages. A
    /// snapshot tick alone only sees aggregate counters, not individual job
    /// timestamps, so this is the only place average processing time and
    /// average wait time get computed.
    async fn run_duration_listener(&self) {
        let (subscription, mut rx) = self.0.events.subscribe();
        let mut shutdown = self.0.shutdown.clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let (queue_name, job_id) = match event {
                Event::JobCompleted { queue, job_id } => (queue, job_id),
                Event::JobFailed { queue, job_id } => (queue, job_id),
                _ => continue,
            };
            let Some(queue) = self.0.queues.get(&queue_name) else { continue };
            let Ok(Some(record)) = queue.get_job(&job_id).await else { continue };

            let wait_ms = record
                .processed_at
                .map(|processed| (processed - record.created_at).num_milliseconds().max(0) as f64);
            let processing_ms = match (record.processed_at, record.finished_at) {
                (Some(processed), Some(finished)) => Some((finished - processed).num_milliseconds().max(0) as f64),
                _ => None,
            };

            let mut accumulators = self.0.accumulators.lock().unwrap();
            let accumulator = accumulators.entry(queue_name).or_insert_with(QueueAccumulator::new);
            if let Some(wait_ms) = wait_ms {
                accumulator.avg_wait_ms.observe(wait_ms);
            }
            if let Some(processing_ms) = processing_ms {
                accumulator.avg_processing_ms.observe(processing_ms);
            }
        }
        self.0.events.unsubscribe(subscription);
    }

    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.0.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }

    async fn run(&self) {
        let mut shutdown = self.0.shutdown.clone();
        let interval = Duration::from_millis(self.0.monitoring.metrics_interval_ms);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.snapshot().await {
                Ok(snapshot) => {
                    self.check_alerts(&snapshot);
                    *self.0.last_snapshot.lock().unwrap() = Some(snapshot);
                }
                Err(error) => {
                    event!(Level::WARN, %error, "metrics snapshot failed");
                }
            }
        }
    }

    fn check_alerts(&self, snapshot: &[QueueMetrics]) {
        for metrics in snapshot {
            if let Some(threshold) = self.0.monitoring.alert_backlog_threshold {
                let backlog = metrics.waiting + metrics.delayed;
                if backlog > threshold {
                    event!(
                        Level::WARN,
                        queue = %metrics.name,
                        backlog,
                        threshold,
                        "queue backlog exceeds alert threshold"
                    );
                }
            }
            if let Some(threshold) = self.0.monitoring.alert_failure_rate_threshold {
                if metrics.error_rate > threshold {
                    event!(
                        Level::WARN,
                        queue = %metrics.name,
                        error_rate = metrics.error_rate,
                        threshold,
                        "queue error rate exceeds alert threshold"
                    );
                }
            }
        }
    }

    /// Pulls a fresh status for every registered queue and folds it into
    /// the running throughput/error-rate accumulators.
    pub async fn snapshot(&self) -> Result<Vec<QueueMetrics>, Error> {
        let queues: Vec<Queue> = self.0.queues.values().cloned().collect();
        let mut out = Vec::with_capacity(queues.len());
        let mut accumulators = self.0.accumulators.lock().unwrap();

        for queue in queues {
            let status = queue.status().await?;
            let accumulator = accumulators
                .entry(status.name.clone())
                .or_insert_with(QueueAccumulator::new);

            let completed_delta = status.completed.saturating_sub(accumulator.previous_completed);
            let failed_delta = status.failed.saturating_sub(accumulator.previous_failed);
            accumulator.previous_completed = status.completed;
            accumulator.previous_failed = status.failed;

            let interval_secs = (self.0.monitoring.metrics_interval_ms as f64 / 1000.0).max(0.001);
            accumulator.throughput_per_sec.observe(completed_delta as f64 / interval_secs);

            let finished_delta = completed_delta + failed_delta;
            if finished_delta > 0 {
                accumulator.error_rate.observe(failed_delta as f64 / finished_delta as f64);
            }

            out.push(QueueMetrics {
                name: status.name,
                waiting: status.waiting,
                delayed: status.delayed,
                active: status.active,
                completed: status.completed,
                failed: status.failed,
                dead_lettered: status.dead_lettered,
                throughput_per_sec: accumulator.throughput_per_sec.get(),
                error_rate: accumulator.error_rate.get(),
                avg_wait_ms: accumulator.avg_wait_ms.get(),
                avg_processing_ms: accumulator.avg_processing_ms.get(),
            });
        }
        Ok(out)
    }

    fn worker_metrics(&self) -> Vec<WorkerMetrics> {
        let memory_kb = process_memory_kb();
        self.0
            .worker_pools
            .values()
            .flat_map(|pool| {
                let queue = pool.queue_name().to_string();
                pool.worker_snapshots().into_iter().map(move |snapshot| WorkerMetrics {
                    queue: queue.clone(),
                    worker_id: snapshot.id,
                    busy: snapshot.busy,
                    in_flight: snapshot.in_flight,
                    last_activity: snapshot.last_activity,
                    memory_kb,
                })
            })
            .collect()
    }

    /// Pings Redis with the configured timeout and combines that with live
    /// queue/worker state into an overall [`HealthStatus`]:
    /// unreachable Redis is always `Unhealthy`; reachable Redis with every
    /// queue that has a worker pool configured actually running at least
    /// one live worker is `Healthy`; reachable Redis with some such queue
    /// running zero workers (or a backlog/error-rate alert firing) is
    /// `Degraded`.
    pub async fn health_check(&self) -> Result<HealthReport, Error> {
        let redis_reachable = self.ping_redis().await;
        let queues = self.snapshot().await.unwrap_or_default();
        let workers = self.worker_metrics();

        let mut alerts = Vec::new();
        if !redis_reachable {
            alerts.push("redis unreachable".to_string());
        }
        for (name, pool) in &self.0.worker_pools {
            if pool.worker_count() == 0 {
                alerts.push(format!("{name} has no live workers"));
            }
        }
        for metrics in &queues {
            if let Some(threshold) = self.0.monitoring.alert_backlog_threshold {
                if metrics.waiting + metrics.delayed > threshold {
                    alerts.push(format!("{} backlog exceeds {}", metrics.name, threshold));
                }
            }
            if let Some(threshold) = self.0.monitoring.alert_failure_rate_threshold {
                if metrics.error_rate > threshold {
                    alerts.push(format!("{} error rate exceeds {}", metrics.name, threshold));
                }
            }
        }

        let status = if !redis_reachable {
            HealthStatus::Unhealthy
        } else if !alerts.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthReport { status, redis_reachable, queues, workers, alerts })
    }

    async fn ping_redis(&self) -> bool {
        let attempts = self.0.health.retries + 1;
        for attempt in 0..attempts {
            let timeout = Duration::from_millis(self.0.health.timeout_ms);
            let result = tokio::time::timeout(timeout, self.ping_once()).await;
            if matches!(result, Ok(Ok(()))) {
                return true;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        false
    }

    async fn ping_once(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_converges_toward_repeated_sample() {
        let mut ema = Ema::new(0.5);
        for _ in 0..10 {
            ema.observe(10.0);
        }
        assert!((ema.get() - 10.0).abs() < 0.01);
    }

    #[test]
    fn ema_is_unset_before_first_sample() {
        let ema = Ema::new(0.5);
        assert_eq!(ema.get(), 0.0);
    }
}
