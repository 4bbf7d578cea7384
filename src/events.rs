//! Typed, explicitly-subscribed event fan-out for queue observers.
//!
//! Subscribing returns a [`SubscriptionId`] and a channel; dropping the
//! receiver is enough to stop delivery, but callers that want to free the
//! slot in the subscriber table immediately can call
//! [`EventBus::unsubscribe`] explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::job::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
pub enum Event {
    JobAdded { queue: String, job_id: String },
    JobCompleted { queue: String, job_id: String },
    JobFailed { queue: String, job_id: String },
    JobProgress { queue: String, job_id: String, progress: Progress },
    JobStalled { queue: String, job_id: String },
    /// Emitted once, synchronously, at the start of
    /// [`crate::manager::QueueManager::graceful_shutdown`] — before any
    /// worker pool is signaled to drain.
    ShutdownStarted,
}

/// Shared, cloneable event bus. Every [`crate::queue::Queue`] created by the
/// same manager shares one bus so a single subscriber can observe every
/// queue at once.
#[derive(Clone)]
pub struct EventBus {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus {
            inner: std::sync::Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().unwrap().insert(id, tx);
        (SubscriptionId(id), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.lock().unwrap().remove(&id.0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Fan the event out to every live subscriber. A subscriber whose
    /// receiver was dropped without calling `unsubscribe` is pruned lazily
    /// here rather than on every send.
    pub fn emit(&self, event: Event) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();

        bus.emit(Event::JobAdded { queue: "q".into(), job_id: "1".into() });

        let event = rx.recv().await.expect("event delivered");
        assert!(matches!(event, Event::JobAdded { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_frees_slot() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);

        bus.emit(Event::JobAdded { queue: "q".into(), job_id: "1".into() });

        assert_eq!(bus.subscriber_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_emit() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();
        drop(rx);

        bus.emit(Event::JobAdded { queue: "q".into(), job_id: "1".into() });

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let (_id1, mut rx1) = bus.subscribe();
        let (_id2, mut rx2) = bus.subscribe();

        bus.emit(Event::JobCompleted { queue: "q".into(), job_id: "42".into() });

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
