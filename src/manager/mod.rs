//! The Queue Manager: owns the Redis connection, the queue
//! registry, and the lifecycle of everything built on top of it — worker
//! pools, the scheduler, the stream bridge, and the metrics/health loop.
//! A [`QueueManager`] is an explicitly-constructed value; nothing in this
//! crate reaches for a process-wide singleton.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{event, Level};

use autoweave_graceful_shutdown::GracefulShutdown;

use crate::config::{Config, QueueSettings};
use crate::error::{Error, ValidationError};
use crate::events::{Event, EventBus, SubscriptionId};
use crate::job::{JobSubmission, validate_payload};
use crate::metrics::{HealthReport, Metrics};
use crate::queue::Queue;
use crate::registry::ProcessorRegistry;
use crate::scheduler::Scheduler;
use crate::stream_bridge::StreamBridge;
use crate::worker_pool::WorkerPool;

enum ShutdownState {
    NotStarted,
    /// Becomes `true` once the shutdown this state was entered under has
    /// finished. Holding a clone of this receiver lets a second,
    /// concurrent `graceful_shutdown` call await the first one's
    /// completion instead of repeating the work.
    InProgress(watch::Receiver<bool>),
    Done,
}

struct ManagerInner {
    pool: autoweave_database::RedisPool,
    registry: ProcessorRegistry,
    queues: Mutex<HashMap<String, Queue>>,
    worker_pools: Mutex<HashMap<String, WorkerPool>>,
    scheduler: Scheduler,
    stream_bridge: Option<StreamBridge>,
    metrics: Metrics,
    events: EventBus,
    shutdown: GracefulShutdown,
    shutdown_state: Mutex<ShutdownState>,
    ready: std::sync::atomic::AtomicBool,
}

/// Owns the lifecycle of every component in the system. Cheaply cloneable;
/// every clone shares the same queues, worker pools, and background tasks.
#[derive(Clone)]
pub struct QueueManager(Arc<ManagerInner>);

impl QueueManager {
    /// Connects to Redis, instantiates a [`Queue`] (and, if a worker pool is
    /// configured, a [`WorkerPool`]) for every queue named in `config`,
    /// starts the scheduler and metrics/health loops, and — if
    /// `config.usb_bridge.enabled` — the stream bridge.
    pub async fn initialize(config: Config, registry: ProcessorRegistry) -> Result<QueueManager, Error> {
        let pool = autoweave_database::RedisPool::new(
            config.redis.to_database_config(),
            config.redis.key_prefix.clone(),
        )?;

        // Fail fast if Redis isn't reachable rather than starting "ready"
        // and only discovering the problem on the first submission.
        let mut conn = pool.get().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        drop(conn);

        let events = EventBus::new();
        let shutdown = GracefulShutdown::new();

        let mut queues = HashMap::new();
        let mut worker_pools = HashMap::new();
        for queue_settings in &config.queues {
            let worker_settings = queue_settings
                .workers
                .clone()
                .unwrap_or_else(|| config.default_worker_pool.clone());
            let queue = Queue::new(pool.clone(), queue_settings.name.clone(), worker_settings, events.clone());

            if queue.worker_pool_settings().max_workers > 0 {
                let worker_pool = WorkerPool::new(queue.clone(), registry.clone(), shutdown.consumer());
                worker_pool.start();
                worker_pools.insert(queue_settings.name.clone(), worker_pool);
            }

            queues.insert(queue_settings.name.clone(), queue);
        }

        let scheduler = Scheduler::new(pool.clone(), queues.clone(), config.scheduler.clone(), shutdown.consumer());
        scheduler.start().await?;

        let metrics = Metrics::new(
            pool.clone(),
            queues.clone(),
            worker_pools.clone(),
            config.monitoring.clone(),
            config.health.clone(),
            events.clone(),
            shutdown.consumer(),
        );
        metrics.start();

        let stream_bridge = if config.usb_bridge.enabled {
            let target_name = config
                .usb_bridge
                .target_queue
                .clone()
                .or_else(|| queues.keys().next().cloned())
                .ok_or_else(|| {
                    ValidationError::InvalidPayload {
                        kind: crate::job::JobKind::UsbAttach,
                        reason: "usbBridge.enabled but no target queue is configured".to_string(),
                    }
                })?;
            let target_queue = queues
                .get(&target_name)
                .cloned()
                .ok_or_else(|| ValidationError::UnknownQueue(target_name.clone()))?;
            let bridge = StreamBridge::new(pool.clone(), target_queue, config.usb_bridge.clone(), shutdown.consumer());
            bridge.start();
            Some(bridge)
        } else {
            None
        };

        event!(Level::INFO, queues = queues.len(), "queue manager initialized");

        Ok(QueueManager(Arc::new(ManagerInner {
            pool,
            registry,
            queues: Mutex::new(queues),
            worker_pools: Mutex::new(worker_pools),
            scheduler,
            stream_bridge,
            metrics,
            events,
            shutdown,
            shutdown_state: Mutex::new(ShutdownState::NotStarted),
            ready: std::sync::atomic::AtomicBool::new(true),
        })))
    }

    pub fn is_ready(&self) -> bool {
        self.0.ready.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn events(&self) -> &EventBus {
        &self.0.events
    }

    pub fn subscribe(&self) -> (SubscriptionId, tokio::sync::mpsc::UnboundedReceiver<Event>) {
        self.0.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    pub fn stream_bridge(&self) -> Option<&StreamBridge> {
        self.0.stream_bridge.as_ref()
    }

    /// Registers a new, empty queue. Rejects a duplicate name.
    pub fn create_queue(&self, settings: QueueSettings, default_worker_pool: crate::config::WorkerPoolSettings) -> Result<Queue, Error> {
        let mut queues = self.0.queues.lock().unwrap();
        if queues.contains_key(&settings.name) {
            return Err(ValidationError::DuplicateQueue(settings.name).into());
        }
        let worker_settings = settings.workers.clone().unwrap_or(default_worker_pool);
        let queue = Queue::new(self.0.pool.clone(), settings.name.clone(), worker_settings, self.0.events.clone());

        if queue.worker_pool_settings().max_workers > 0 {
            let worker_pool = WorkerPool::new(queue.clone(), self.0.registry.clone(), self.0.shutdown.consumer());
            worker_pool.start();
            self.0.worker_pools.lock().unwrap().insert(settings.name.clone(), worker_pool);
        }

        queues.insert(settings.name.clone(), queue.clone());
        event!(Level::INFO, queue = %queue.name(), "queue created");
        Ok(queue)
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.0.queues.lock().unwrap().get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.0.queues.lock().unwrap().keys().cloned().collect()
    }

    pub fn worker_pool(&self, queue_name: &str) -> Option<WorkerPool> {
        self.0.worker_pools.lock().unwrap().get(queue_name).cloned()
    }

    fn queue_or_err(&self, name: &str) -> Result<Queue, Error> {
        self.queue(name).ok_or_else(|| ValidationError::UnknownQueue(name.to_string()).into())
    }

    /// Submits one job to `queue_name`. Rejects at submission time — before
    /// anything reaches Redis — if the job's `kind` has no registered
    /// processor: a missing kind is a fatal submission-time error, not a
    /// runtime one.
    pub async fn submit(&self, queue_name: &str, submission: JobSubmission) -> Result<String, Error> {
        let queue = self.queue_or_err(queue_name)?;
        self.check_registered(&submission)?;
        queue.enqueue(submission).await
    }

    pub async fn submit_bulk(&self, queue_name: &str, submissions: Vec<JobSubmission>) -> Result<Vec<String>, Error> {
        let queue = self.queue_or_err(queue_name)?;
        for submission in &submissions {
            self.check_registered(submission)?;
        }
        queue.enqueue_bulk(submissions).await
    }

    fn check_registered(&self, submission: &JobSubmission) -> Result<(), Error> {
        validate_payload(&submission.payload)?;
        let kind = submission.payload.kind();
        if !self.0.registry.contains(kind) {
            return Err(ValidationError::UnknownKind(kind).into());
        }
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthReport, Error> {
        self.0.metrics.health_check().await
    }

    /// Orchestrates shutdown: (1) flag + emit
    /// `ShutdownStarted`; (2) stop the scheduler and stream bridge ingress;
    /// (3) signal every worker pool to drain, bounded by `timeout`; (4)
    /// drop the in-process queue handles; (5) close the Redis pool.
    ///
    /// Concurrent callers share one completion signal: the first caller
    /// does the work, later callers just await it.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx_if_waiting = None;
        let mut tx_if_owner = None;
        {
            let mut state = self.0.shutdown_state.lock().unwrap();
            match &*state {
                ShutdownState::Done => return Ok(()),
                ShutdownState::InProgress(rx) => {
                    rx_if_waiting = Some(rx.clone());
                }
                ShutdownState::NotStarted => {
                    let (tx, rx) = watch::channel(false);
                    *state = ShutdownState::InProgress(rx);
                    tx_if_owner = Some(tx);
                }
            }
        }

        if let Some(mut rx) = rx_if_waiting {
            let _ = rx.changed().await;
            return Ok(());
        }
        // `tx` stays alive (and its receivers' clones un-closed) for the
        // duration of the actual shutdown work below; concurrent callers
        // block on it rather than racing ahead.
        let tx = tx_if_owner.expect("owner branch always produces a sender");

        self.0.ready.store(false, std::sync::atomic::Ordering::Relaxed);
        event!(Level::INFO, "graceful shutdown started");
        self.0.events.emit(Event::ShutdownStarted);

        self.0.scheduler.shutdown().await;
        if let Some(bridge) = &self.0.stream_bridge {
            bridge.shutdown().await;
        }

        let pools: Vec<WorkerPool> = self.0.worker_pools.lock().unwrap().values().cloned().collect();
        let drains = pools.iter().map(|pool| pool.shutdown(timeout));
        futures::future::join_all(drains).await;

        self.0.queues.lock().unwrap().clear();
        self.0.metrics.shutdown().await;
        self.0.pool.close();

        event!(Level::INFO, "graceful shutdown complete");

        *self.0.shutdown_state.lock().unwrap() = ShutdownState::Done;
        let _ = tx.send(true);
        Ok(())
    }

    pub fn shutdown_consumer(&self) -> autoweave_graceful_shutdown::GracefulShutdownConsumer {
        self.0.shutdown.consumer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_error(result: &Result<String, Error>) -> bool {
        matches!(result, Err(Error::Validation(_)))
    }

    #[test]
    fn check_registered_detects_missing_processor() {
        let registry = crate::registry::ProcessorRegistryBuilder::new().build();
        let pool = autoweave_database::RedisPool::from_url("redis://127.0.0.1:0", None).unwrap();
        let manager = ManagerInner {
            pool: pool.clone(),
            registry,
            queues: Mutex::new(HashMap::new()),
            worker_pools: Mutex::new(HashMap::new()),
            scheduler: Scheduler::new(
                pool.clone(),
                HashMap::new(),
                crate::config::SchedulerSettings::default(),
                autoweave_graceful_shutdown::GracefulShutdown::new().consumer(),
            ),
            stream_bridge: None,
            metrics: Metrics::new(
                pool,
                HashMap::new(),
                HashMap::new(),
                crate::config::MonitoringSettings::default(),
                crate::config::HealthSettings::default(),
                EventBus::new(),
                autoweave_graceful_shutdown::GracefulShutdown::new().consumer(),
            ),
            events: EventBus::new(),
            shutdown: GracefulShutdown::new(),
            shutdown_state: Mutex::new(ShutdownState::NotStarted),
            ready: std::sync::atomic::AtomicBool::new(true),
        };
        let manager = QueueManager(Arc::new(manager));

        let submission = JobSubmission::new(crate::job::JobPayload::UsbScan(crate::job::UsbScanPayload { bus: None }));
        let result = manager.check_registered(&submission).map(|_| String::new());
        assert!(validation_error(&result));
    }
}
