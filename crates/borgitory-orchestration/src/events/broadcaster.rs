//! # Event Broadcaster
//!
//! One broadcaster serves every subscriber. `publish` never blocks the
//! producer: each subscriber owns a bounded queue, and when it is full the
//! oldest event for that subscriber is dropped and counted. New
//! subscribers can ask for a replay of the most recent events. A
//! maintenance task emits keep-alive events when nothing has been published
//! for the configured idle period, letting long-lived consumers detect
//! liveness.
//!
//! Events are delivered to each subscriber in global publish order; across
//! subscribers delivery is independent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use borgitory_shared::types::JobEvent;

#[derive(Debug)]
struct SubscriberQueue {
    queue: Mutex<VecDeque<JobEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: JobEvent, cap: usize) {
        {
            let mut queue = self.queue.lock().expect("subscriber lock");
            if queue.len() == cap {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[derive(Debug)]
struct BroadcasterInner {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberQueue>>>,
    replay: Mutex<VecDeque<JobEvent>>,
    last_publish: Mutex<Instant>,
    next_subscriber_id: AtomicU64,
    queue_cap: usize,
    replay_cap: usize,
}

/// Single-producer / many-subscriber event bus
#[derive(Debug, Clone)]
pub struct JobEventBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl JobEventBroadcaster {
    /// `queue_cap`: bound of each subscriber queue; `replay_cap`: how many
    /// recent events new subscribers may replay.
    pub fn new(queue_cap: usize, replay_cap: usize) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscribers: Mutex::new(HashMap::new()),
                replay: Mutex::new(VecDeque::with_capacity(replay_cap)),
                last_publish: Mutex::new(Instant::now()),
                next_subscriber_id: AtomicU64::new(0),
                queue_cap,
                replay_cap,
            }),
        }
    }

    /// Enqueue `event` on every subscriber queue. Non-blocking: a full
    /// queue drops its oldest event instead of suspending the producer.
    pub fn publish(&self, event: JobEvent) {
        {
            let mut replay = self.inner.replay.lock().expect("replay lock");
            if replay.len() == self.inner.replay_cap {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }
        *self.inner.last_publish.lock().expect("publish lock") = Instant::now();

        let subscribers = self.inner.subscribers.lock().expect("subscriber map");
        trace!(event_type = %event.event_type, fanout = subscribers.len(), "publishing event");
        for queue in subscribers.values() {
            queue.push(event.clone(), self.inner.queue_cap);
        }
    }

    /// Register a subscriber. With `send_replay`, the most recent events
    /// are preloaded onto its queue before any future event.
    pub fn subscribe(&self, send_replay: bool) -> EventSubscription {
        let queue = Arc::new(SubscriberQueue::new());
        if send_replay {
            let replay = self.inner.replay.lock().expect("replay lock");
            for event in replay.iter() {
                queue.push(event.clone(), self.inner.queue_cap);
            }
        }
        let id = self
            .inner
            .next_subscriber_id
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber map")
            .insert(id, queue.clone());
        debug!(subscriber_id = id, send_replay, "subscriber registered");
        EventSubscription {
            id,
            queue,
            broadcaster: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("subscriber map").len()
    }

    /// Spawn the keep-alive loop: when nothing has been published within
    /// `idle`, a keep-alive event is broadcast. Abort the handle on
    /// shutdown.
    pub fn spawn_keepalive(&self, idle: Duration) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            let tick = idle.min(Duration::from_secs(5)).max(Duration::from_millis(50));
            loop {
                tokio::time::sleep(tick).await;
                let idle_for = broadcaster
                    .inner
                    .last_publish
                    .lock()
                    .expect("publish lock")
                    .elapsed();
                if idle_for >= idle {
                    broadcaster.publish(JobEvent::keep_alive());
                }
            }
        })
    }

    fn unsubscribe_id(inner: &BroadcasterInner, id: u64) {
        if let Some(queue) = inner
            .subscribers
            .lock()
            .expect("subscriber map")
            .remove(&id)
        {
            queue.close();
            debug!(subscriber_id = id, "subscriber removed");
        }
    }
}

/// A subscriber's end of the bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    broadcaster: std::sync::Weak<BroadcasterInner>,
}

impl EventSubscription {
    /// Next event in publish order, or `None` once unsubscribed and
    /// drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Register before checking the queue so a push between the
            // check and the await still wakes us.
            notified.as_mut().enable();
            {
                let mut queue = self.queue.queue.lock().expect("subscriber lock");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Events dropped for this subscriber due to queue overflow
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Idempotent detach; the queue drains and then ends
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.broadcaster.upgrade() {
            JobEventBroadcaster::unsubscribe_id(&inner, self.id);
        }
    }

    /// Adapt into a `Stream` of events
    pub fn into_stream(self) -> impl Stream<Item = JobEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borgitory_shared::types::{EventType, JobId};
    use futures::StreamExt;

    fn event(n: u64) -> JobEvent {
        JobEvent::new(EventType::TaskOutput, Some(JobId::new()))
            .with_data(serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let broadcaster = JobEventBroadcaster::new(100, 20);
        let mut sub = broadcaster.subscribe(false);
        for n in 0..5 {
            broadcaster.publish(event(n));
        }
        for n in 0..5 {
            let got = sub.recv().await.expect("event");
            assert_eq!(got.data["n"], n);
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_counts() {
        let broadcaster = JobEventBroadcaster::new(3, 20);
        let mut sub = broadcaster.subscribe(false);
        for n in 0..5 {
            broadcaster.publish(event(n));
        }
        assert_eq!(sub.dropped(), 2);
        // The two oldest were dropped for this subscriber
        assert_eq!(sub.recv().await.expect("event").data["n"], 2);
        assert_eq!(sub.recv().await.expect("event").data["n"], 3);
        assert_eq!(sub.recv().await.expect("event").data["n"], 4);
    }

    #[tokio::test]
    async fn test_replay_precedes_live_events() {
        let broadcaster = JobEventBroadcaster::new(100, 20);
        broadcaster.publish(event(1));
        broadcaster.publish(event(2));

        let mut sub = broadcaster.subscribe(true);
        broadcaster.publish(event(3));

        assert_eq!(sub.recv().await.expect("event").data["n"], 1);
        assert_eq!(sub.recv().await.expect("event").data["n"], 2);
        assert_eq!(sub.recv().await.expect("event").data["n"], 3);
    }

    #[tokio::test]
    async fn test_replay_ring_is_bounded() {
        let broadcaster = JobEventBroadcaster::new(100, 2);
        for n in 0..4 {
            broadcaster.publish(event(n));
        }
        let mut sub = broadcaster.subscribe(true);
        assert_eq!(sub.recv().await.expect("event").data["n"], 2);
        assert_eq!(sub.recv().await.expect("event").data["n"], 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_ends_stream() {
        let broadcaster = JobEventBroadcaster::new(100, 20);
        let mut sub = broadcaster.subscribe(false);
        broadcaster.publish(event(1));
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(broadcaster.subscriber_count(), 0);

        // Queued event still drains, then the stream ends
        assert_eq!(sub.recv().await.expect("event").data["n"], 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broadcaster = JobEventBroadcaster::new(100, 20);
        let sub = broadcaster.subscribe(false);
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_emitted_when_idle() {
        let broadcaster = JobEventBroadcaster::new(100, 20);
        let mut sub = broadcaster.subscribe(false);
        let handle = broadcaster.spawn_keepalive(Duration::from_millis(100));

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("keep-alive within timeout")
            .expect("event");
        assert_eq!(got.event_type, EventType::KeepAlive);
        handle.abort();
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        let broadcaster = JobEventBroadcaster::new(100, 20);
        let sub = broadcaster.subscribe(false);
        broadcaster.publish(event(7));
        let mut stream = Box::pin(sub.into_stream());
        let got = stream.next().await.expect("event");
        assert_eq!(got.data["n"], 7);
    }
}
