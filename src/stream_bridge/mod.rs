//! Stream-to-queue bridge: reads USB hot-plug events off a
//! durable Redis stream consumer group and turns them into jobs on a
//! target queue, with per-signature duplicate protection, debouncing,
//! rate limiting with an overflow spill queue, and ack-after-durable-write
//! semantics so a crash mid-batch yields redelivery, not loss.

mod scripts;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{event, Level};

use autoweave_graceful_shutdown::GracefulShutdownConsumer;

use crate::config::UsbBridgeSettings;
use crate::error::Error;
use crate::job::{JobMetadata, JobOptions, JobPayload, JobSource, JobSubmission, UsbAttachPayload, UsbDetachPayload, UsbDeviceInfo};
use crate::queue::Queue;
use crate::redis_keys::USB_CONNECTED_KEY;

use self::scripts::{AttachScript, DetachScript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Action {
    Attach,
    Detach,
}

/// One parsed stream entry, before it's turned into a job submission.
struct StreamEvent {
    message_id: String,
    action: Action,
    device: UsbDeviceInfo,
    plugin_id: Option<String>,
}

/// A job that lost the race for a rate-limit token and is waiting its
/// turn. Its stream message is *not* yet acknowledged — see module docs.
struct OverflowItem {
    message_id: String,
    submission: JobSubmission,
}

/// Plain token bucket: `rate_per_sec` tokens refill continuously, capped at
/// one second's worth. `try_take` is synchronous and lock-guarded so the
/// poll loop and the overflow-drain ticker can share one limiter.
struct RateLimiter {
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        RateLimiter {
            rate_per_sec: rate_per_sec.max(1) as f64,
            tokens: rate_per_sec.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct BridgeInner {
    pool: autoweave_database::RedisPool,
    queue: Queue,
    settings: UsbBridgeSettings,
    shutdown: GracefulShutdownConsumer,
    attach_script: AttachScript,
    detach_script: DetachScript,
    debounce: Mutex<FxHashMap<(String, Action), Instant>>,
    retry_counts: Mutex<FxHashMap<String, u32>>,
    rate_limiter: Mutex<RateLimiter>,
    overflow: Mutex<VecDeque<OverflowItem>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to the bridge. Every clone shares the same
/// debounce/overflow state and background tasks.
#[derive(Clone)]
pub struct StreamBridge(std::sync::Arc<BridgeInner>);

impl StreamBridge {
    pub fn new(
        pool: autoweave_database::RedisPool,
        target_queue: Queue,
        settings: UsbBridgeSettings,
        shutdown: GracefulShutdownConsumer,
    ) -> Self {
        StreamBridge(std::sync::Arc::new(BridgeInner {
            pool,
            queue: target_queue,
            rate_limiter: Mutex::new(RateLimiter::new(settings.rate_limit_per_sec)),
            settings,
            shutdown,
            attach_script: AttachScript::new(),
            detach_script: DetachScript::new(),
            debounce: Mutex::new(FxHashMap::default()),
            retry_counts: Mutex::new(FxHashMap::default()),
            overflow: Mutex::new(VecDeque::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn connected_key(&self) -> String {
        self.0.pool.key(USB_CONNECTED_KEY)
    }

    /// Ensures the consumer group exists, then spawns the poll loop and the
    /// overflow-drain ticker.
    pub fn start(&self) {
        let bridge = self.clone();
        let task = tokio::spawn(async move {
            if let Err(error) = bridge.ensure_consumer_group().await {
                event!(Level::ERROR, %error, "stream bridge failed to create consumer group");
                return;
            }
            bridge.run().await;
        });
        self.0.tasks.lock().unwrap().push(task);

        let drain_bridge = self.clone();
        let drain_task = tokio::spawn(async move {
            drain_bridge.run_overflow_drain().await;
        });
        self.0.tasks.lock().unwrap().push(drain_task);
    }

    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.0.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
    }

    async fn ensure_consumer_group(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.0.settings.stream_name)
            .arg(&self.0.settings.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn run(&self) {
        let mut shutdown = self.0.shutdown.clone();
        // One pass over already-delivered-but-unacked messages for this
        // consumer name, in case the process restarted mid-batch.
        if let Err(error) = self.poll_once("0").await {
            event!(Level::WARN, %error, "stream bridge pending-message replay failed");
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                result = self.poll_once(">") => {
                    if let Err(error) = result {
                        event!(Level::ERROR, %error, "stream bridge poll failed");
                        tokio::select! {
                            _ = tokio::time::sleep(self.0.settings.poll_interval()) => {}
                            _ = shutdown.wait_for_shutdown() => break,
                        }
                    }
                }
            }
        }
    }

    /// Reads one batch (either pending, with `"0"`, or new, with `">"`) and
    /// processes every entry in it.
    async fn poll_once(&self, start_id: &str) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.0.settings.consumer_group)
            .arg(&self.0.settings.consumer_name)
            .arg("COUNT")
            .arg(self.0.settings.batch_size)
            .arg("BLOCK")
            .arg(self.0.settings.poll_interval_ms)
            .arg("STREAMS")
            .arg(&self.0.settings.stream_name)
            .arg(start_id)
            .query_async(&mut conn)
            .await?;
        drop(conn);

        for (message_id, fields) in parse_stream_entries(&reply) {
            match parse_event(message_id, &fields) {
                Ok(event) => {
                    if self.passes_plugin_filter(event.plugin_id.as_deref()) {
                        self.handle_event(event).await;
                    } else {
                        event!(Level::DEBUG, message_id = %event.message_id, "stream bridge dropped event outside plugin allow-list");
                        self.ack(&event.message_id).await;
                    }
                }
                Err(reason) => {
                    event!(Level::WARN, %reason, "stream bridge dropping unparseable message");
                    self.ack(&fields_message_id(&fields)).await;
                }
            }
        }
        Ok(())
    }

    /// When [`UsbBridgeSettings::plugin_filtering`] is set, only events
    /// tagged with a plugin id on that list are turned into jobs; events
    /// with no plugin id at all are never filtered out this way.
    fn passes_plugin_filter(&self, plugin_id: Option<&str>) -> bool {
        plugin_allowed(&self.0.settings.plugin_filtering, plugin_id)
    }

    async fn handle_event(&self, event: StreamEvent) {
        let signature = event.device.signature.clone();

        if self.is_debounced(&signature, event.action) {
            self.ack(&event.message_id).await;
            return;
        }

        let should_enqueue = match event.action {
            Action::Attach => match self.try_attach(&event.device).await {
                Ok(fresh) => fresh,
                Err(error) => {
                    self.note_retry_or_drop(&event).await;
                    event!(Level::ERROR, %error, signature = %signature, "stream bridge attach dedup failed");
                    return;
                }
            },
            Action::Detach => match self.try_detach(&signature).await {
                Ok(_) => true,
                Err(error) => {
                    self.note_retry_or_drop(&event).await;
                    event!(Level::ERROR, %error, signature = %signature, "stream bridge detach removal failed");
                    return;
                }
            },
        };

        if !should_enqueue {
            event!(Level::DEBUG, signature = %signature, "stream bridge dropped duplicate attach");
            self.ack(&event.message_id).await;
            return;
        }

        let submission = self.build_submission(&event);
        self.dispatch(event.message_id, submission).await;
    }

    /// Keyed on `(signature, action)`, not signature alone, so a
    /// state-changing `detach` arriving just after an `attach` for the same
    /// device (or vice versa) is never swallowed by the other action's
    /// debounce window — only repeats of the *same* action within the
    /// window are suppressed.
    fn is_debounced(&self, signature: &str, action: Action) -> bool {
        let now = Instant::now();
        let mut debounce = self.0.debounce.lock().unwrap();
        let key = (signature.to_string(), action);
        let suppressed = match debounce.get(&key) {
            Some(last) => now.duration_since(*last) < self.0.settings.debounce(),
            None => false,
        };
        debounce.insert(key, now);
        suppressed
    }

    async fn try_attach(&self, device: &UsbDeviceInfo) -> Result<bool, Error> {
        let mut conn = self.0.pool.get().await?;
        let json = serde_json::to_string(device)?;
        self.0
            .attach_script
            .run(&mut conn, &self.connected_key(), &device.signature, &json)
            .await
    }

    async fn try_detach(&self, signature: &str) -> Result<bool, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0.detach_script.run(&mut conn, &self.connected_key(), signature).await
    }

    fn build_submission(&self, event: &StreamEvent) -> JobSubmission {
        let payload = match event.action {
            Action::Attach => JobPayload::UsbAttach(UsbAttachPayload { device: event.device.clone() }),
            Action::Detach => JobPayload::UsbDetach(UsbDetachPayload { device: event.device.clone() }),
        };
        let mut metadata = JobMetadata::new(JobSource::UsbDaemon);
        metadata.plugin_id = event.plugin_id.clone();
        JobSubmission::with_options(payload, JobOptions { metadata: Some(metadata), ..Default::default() })
    }

    /// Takes a rate-limit token and enqueues immediately, or — if none are
    /// available — spills to the overflow queue for the drain ticker to
    /// pick up later. The message is acknowledged only once the job has
    /// actually been written to the target queue.
    async fn dispatch(&self, message_id: String, submission: JobSubmission) {
        let got_token = self.0.rate_limiter.lock().unwrap().try_take();
        if got_token {
            self.enqueue_and_ack(message_id, submission).await;
        } else {
            event!(Level::DEBUG, message_id = %message_id, "stream bridge rate limit hit, deferring to overflow");
            self.0.overflow.lock().unwrap().push_back(OverflowItem { message_id, submission });
        }
    }

    async fn enqueue_and_ack(&self, message_id: String, submission: JobSubmission) {
        match self.0.queue.enqueue(submission).await {
            Ok(job_id) => {
                event!(Level::DEBUG, message_id = %message_id, job_id = %job_id, "stream bridge enqueued job");
                self.ack(&message_id).await;
                self.0.retry_counts.lock().unwrap().remove(&message_id);
            }
            Err(error) => {
                event!(Level::ERROR, message_id = %message_id, %error, "stream bridge enqueue failed");
            }
        }
    }

    async fn note_retry_or_drop(&self, event: &StreamEvent) {
        let attempts = {
            let mut counts = self.0.retry_counts.lock().unwrap();
            let entry = counts.entry(event.message_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempts >= self.0.settings.max_retries {
            event!(Level::WARN, message_id = %event.message_id, attempts, "stream bridge exhausted retry budget, dropping message");
            self.ack(&event.message_id).await;
            self.0.retry_counts.lock().unwrap().remove(&event.message_id);
        }
    }

    async fn ack(&self, message_id: &str) {
        let Ok(mut conn) = self.0.pool.get().await else { return };
        let _: Result<(), redis::RedisError> = redis::cmd("XACK")
            .arg(&self.0.settings.stream_name)
            .arg(&self.0.settings.consumer_group)
            .arg(message_id)
            .query_async(&mut conn)
            .await;
    }

    /// Periodically drains the overflow queue as rate-limit tokens become
    /// available. Ticks at a quarter of the configured rate's per-token
    /// interval (bounded to a sane range) so a deferred event doesn't wait
    /// a full second to be retried.
    async fn run_overflow_drain(&self) {
        let mut shutdown = self.0.shutdown.clone();
        let tick = Duration::from_millis(250).max(Duration::from_millis(1000 / self.0.settings.rate_limit_per_sec.max(1) as u64 / 4));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                _ = tokio::time::sleep(tick) => {}
            }

            loop {
                let has_token = self.0.rate_limiter.lock().unwrap().try_take();
                if !has_token {
                    break;
                }
                let item = self.0.overflow.lock().unwrap().pop_front();
                match item {
                    Some(item) => self.enqueue_and_ack(item.message_id, item.submission).await,
                    None => {
                        // Nothing to drain; return the token we just took.
                        self.0.rate_limiter.lock().unwrap().tokens += 1.0;
                        break;
                    }
                }
            }
        }
    }

    pub fn overflow_len(&self) -> usize {
        self.0.overflow.lock().unwrap().len()
    }
}

/// An allow-list of `None` (unset) permits every event through. Otherwise an
/// event with no plugin id at all is never filtered out by this gate
/// (per the doc comment on [`StreamBridge::passes_plugin_filter`]) — only an
/// event that names a plugin id absent from the list is dropped.
fn plugin_allowed(allow_list: &Option<Vec<String>>, plugin_id: Option<&str>) -> bool {
    match (allow_list, plugin_id) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(allowed), Some(id)) => allowed.iter().any(|p| p == id),
    }
}

fn bytes_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::Status(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Parses the nested reply of `XREADGROUP ... STREAMS <name> <id>` (a
/// single stream was queried) into `(message_id, field_map)` pairs. Inline
/// capacity matches the common default `batch_size` so a typical poll
/// never spills to the heap just to hold its own results.
fn parse_stream_entries(value: &redis::Value) -> SmallVec<[(String, HashMap<String, String>); 16]> {
    let mut out = SmallVec::new();
    let redis::Value::Bulk(streams) = value else { return out };
    for stream in streams {
        let redis::Value::Bulk(stream_pair) = stream else { continue };
        let Some(redis::Value::Bulk(entries)) = stream_pair.get(1) else { continue };
        for entry in entries {
            let redis::Value::Bulk(entry_pair) = entry else { continue };
            let Some(id) = entry_pair.first().and_then(bytes_to_string) else { continue };
            let Some(redis::Value::Bulk(field_values)) = entry_pair.get(1) else { continue };
            let mut map = HashMap::new();
            for chunk in field_values.chunks(2) {
                let (Some(k), Some(v)) = (chunk.first(), chunk.get(1)) else { continue };
                if let (Some(k), Some(v)) = (bytes_to_string(k), bytes_to_string(v)) {
                    map.insert(k, v);
                }
            }
            map.insert("__message_id".to_string(), id.clone());
            out.push((id, map));
        }
    }
    out
}

fn fields_message_id(fields: &HashMap<String, String>) -> String {
    fields.get("__message_id").cloned().unwrap_or_default()
}

fn parse_event(message_id: String, fields: &HashMap<String, String>) -> Result<StreamEvent, String> {
    let action = match fields.get("action").map(String::as_str) {
        Some("attach") => Action::Attach,
        Some("detach") => Action::Detach,
        other => return Err(format!("unknown or missing action: {other:?}")),
    };

    let vendor_id: u16 = fields.get("vendorId").ok_or("missing vendorId")?.parse().map_err(|_| "vendorId not numeric")?;
    let product_id: u16 = fields.get("productId").ok_or("missing productId")?.parse().map_err(|_| "productId not numeric")?;
    let bus: u8 = fields.get("bus").ok_or("missing bus")?.parse().map_err(|_| "bus not numeric")?;
    let address: u8 = fields.get("address").ok_or("missing address")?.parse().map_err(|_| "address not numeric")?;
    let signature = fields.get("signature").ok_or("missing signature")?.clone();

    let device = UsbDeviceInfo { vendor_id, product_id, bus, address, signature };
    device.validate()?;

    let plugin_id = fields.get("pluginId").cloned();
    Ok(StreamEvent { message_id, action, device, plugin_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> StreamBridge {
        let pool = autoweave_database::RedisPool::from_url("redis://127.0.0.1:6379/0", None)
            .expect("building pool (lazy, no connection attempted)");
        let queue = crate::queue::Queue::new(
            pool.clone(),
            "stream-bridge-test",
            crate::config::WorkerPoolSettings::default(),
            crate::events::EventBus::new(),
        );
        let shutdown = autoweave_graceful_shutdown::GracefulShutdown::new().consumer();
        StreamBridge::new(pool, queue, UsbBridgeSettings::default(), shutdown)
    }

    #[test]
    fn debounce_is_keyed_by_action_so_a_detach_following_an_attach_is_not_swallowed() {
        let bridge = bridge();

        // attach(S1) then, inside the debounce window, detach(S1): neither
        // call should be suppressed, since they're different actions.
        assert!(!bridge.is_debounced("sig-1", Action::Attach));
        assert!(!bridge.is_debounced("sig-1", Action::Detach));

        // But a second attach for the same signature, still inside the
        // window, is a repeat of the *same* action and is suppressed.
        assert!(bridge.is_debounced("sig-1", Action::Attach));
    }

    #[test]
    fn rate_limiter_exhausts_then_refills() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.try_take());
        assert!(limiter.try_take());
        assert!(!limiter.try_take());
    }

    #[test]
    fn parse_event_rejects_bad_signature() {
        let mut fields = HashMap::new();
        fields.insert("action".to_string(), "attach".to_string());
        fields.insert("vendorId".to_string(), "1".to_string());
        fields.insert("productId".to_string(), "2".to_string());
        fields.insert("bus".to_string(), "1".to_string());
        fields.insert("address".to_string(), "1".to_string());
        fields.insert("signature".to_string(), "short".to_string());

        let result = parse_event("1-0".to_string(), &fields);
        assert!(result.is_err());
    }

    #[test]
    fn plugin_filter_allows_everything_when_unset() {
        let settings = UsbBridgeSettings::default();
        assert!(settings.plugin_filtering.is_none());
        assert!(plugin_allowed(&settings.plugin_filtering, Some("anything")));
    }

    #[test]
    fn plugin_filter_admits_listed_plugin_and_rejects_others() {
        let allow_list = Some(vec!["trusted-plugin".to_string()]);
        assert!(plugin_allowed(&allow_list, Some("trusted-plugin")));
        assert!(!plugin_allowed(&allow_list, Some("other-plugin")));
    }

    #[test]
    fn plugin_filter_lets_unlabeled_events_through() {
        let allow_list = Some(vec!["trusted-plugin".to_string()]);
        assert!(plugin_allowed(&allow_list, None));
    }

    #[test]
    fn parse_event_accepts_well_formed_attach() {
        let mut fields = HashMap::new();
        fields.insert("action".to_string(), "attach".to_string());
        fields.insert("vendorId".to_string(), "1234".to_string());
        fields.insert("productId".to_string(), "5678".to_string());
        fields.insert("bus".to_string(), "1".to_string());
        fields.insert("address".to_string(), "2".to_string());
        fields.insert("signature".to_string(), "0123456789abcdef".to_string());

        let result = parse_event("1-0".to_string(), &fields).unwrap();
        assert_eq!(result.action, Action::Attach);
        assert_eq!(result.device.vendor_id, 1234);
    }
}
