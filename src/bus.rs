use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{Event, EventFilter};

/* ============================= HANDLERS ============================= */

/// Async event handler. Handlers run concurrently under a per-handler
/// timeout; a panicking handler never affects the others.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);
const FANOUT_TIMEOUT: Duration = Duration::from_secs(10);
const SINK_TIMEOUT: Duration = Duration::from_secs(1);

/* ============================= STATS ============================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStats {
    pub subscribers: usize,
    pub buffer_size: usize,
    pub buffer_used: usize,
    pub buffer_free: usize,
}

/* ============================= BUS ============================= */

struct Inner {
    subscribers: Mutex<HashMap<String, (EventFilter, EventHandler)>>,
    tx: mpsc::Sender<Event>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    buffer_size: usize,
}

/// In-process publish/subscribe fabric with a bounded buffer and a single
/// dispatcher task. Cheap to clone; all clones share one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a bus and start its dispatcher.
    pub fn start(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            subscribers: Mutex::new(HashMap::new()),
            tx,
            closed: AtomicBool::new(false),
            shutdown,
            dispatcher: Mutex::new(None),
            buffer_size,
        });

        let bus = Self { inner };
        let handle = tokio::spawn(dispatch_loop(bus.inner.clone(), rx, shutdown_rx));
        *bus.inner.dispatcher.lock().expect("bus lock poisoned") = Some(handle);
        bus
    }

    /// Register a handler for every event. Idempotent on id.
    pub fn subscribe(&self, id: impl Into<String>, handler: EventHandler) {
        self.subscribe_filtered(id, EventFilter::any(), handler);
    }

    /// Register a handler that only sees events matching the filter.
    pub fn subscribe_filtered(
        &self,
        id: impl Into<String>,
        filter: EventFilter,
        handler: EventHandler,
    ) {
        self.inner
            .subscribers
            .lock()
            .expect("bus lock poisoned")
            .insert(id.into(), (filter, handler));
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: &str) {
        self.inner
            .subscribers
            .lock()
            .expect("bus lock poisoned")
            .remove(id);
    }

    /// Register a channel sink behind a filter. The wrapper re-checks the
    /// filter at delivery time and drops the event if the sink stays full
    /// for more than one second. Returns the subscriber id.
    pub fn subscribe_channel(&self, filter: EventFilter, sink: mpsc::Sender<Event>) -> String {
        let id = Uuid::new_v4().to_string();
        let check = filter.clone();
        let wrapper = handler(move |event: Event| {
            let sink = sink.clone();
            let check = check.clone();
            async move {
                if !check.matches(&event) {
                    return;
                }
                let event_id = event.id.clone();
                if sink.send_timeout(event, SINK_TIMEOUT).await.is_err() {
                    warn!(event = %event_id, "event_sink_blocked_dropping");
                }
            }
        });
        self.subscribe_filtered(id.clone(), filter, wrapper);
        id
    }

    /// Non-blocking enqueue. Drops with a warning when the buffer is full
    /// and silently once the bus is stopped.
    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.inner.tx.try_send(event) {
            warn!(
                event_type = event.event_type.as_str(),
                "event_buffer_full_dropping"
            );
        }
    }

    /// Schedule `publish` on a background task.
    pub fn publish_async(&self, event: Event) {
        let bus = self.clone();
        tokio::spawn(async move {
            bus.publish(event);
        });
    }

    /// Stop the bus: mark closed, cancel the dispatcher, drain the queue,
    /// clear subscribers. Safe to call more than once.
    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);

        let handle = self
            .inner
            .dispatcher
            .lock()
            .expect("bus lock poisoned")
            .take();
        if let Some(handle) = handle
            && tokio::time::timeout(FANOUT_TIMEOUT, handle).await.is_err()
        {
            warn!("event_dispatcher_stop_timed_out");
        }

        self.inner
            .subscribers
            .lock()
            .expect("bus lock poisoned")
            .clear();
    }

    pub fn is_running(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStats {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("bus lock poisoned")
            .len();
        let free = self.inner.tx.capacity();
        BusStats {
            subscribers,
            buffer_size: self.inner.buffer_size,
            buffer_used: self.inner.buffer_size - free,
            buffer_free: free,
        }
    }
}

/* ============================= DISPATCHER ============================= */

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Drain whatever is still queued without dispatching.
                while rx.try_recv().is_ok() {}
                debug!("event_dispatcher_stopped");
                return;
            }
            event = rx.recv() => {
                let Some(event) = event else { return };
                fan_out(&inner, event).await;
            }
        }
    }
}

/// Deliver one event to a snapshot of subscribers. Each handler runs in its
/// own task under the per-handler timeout; the whole fan-out is bounded by
/// the aggregate timeout so one slow handler cannot stall the queue forever.
async fn fan_out(inner: &Inner, event: Event) {
    let snapshot: Vec<(String, EventFilter, EventHandler)> = {
        let subscribers = inner.subscribers.lock().expect("bus lock poisoned");
        subscribers
            .iter()
            .map(|(id, (filter, handler))| (id.clone(), filter.clone(), handler.clone()))
            .collect()
    };

    let mut tasks = Vec::new();
    for (id, filter, handler) in snapshot {
        if !filter.matches(&event) {
            continue;
        }
        let event = event.clone();
        tasks.push(tokio::spawn(async move {
            if tokio::time::timeout(HANDLER_TIMEOUT, handler(event)).await.is_err() {
                warn!(subscriber = %id, "event_handler_timed_out");
            }
        }));
    }

    let join_all = async {
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!(error = %e, "event_handler_panicked");
            }
        }
    };
    if tokio::time::timeout(FANOUT_TIMEOUT, join_all).await.is_err() {
        warn!(
            event_type = event.event_type.as_str(),
            "event_fanout_timed_out"
        );
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSeverity, EventType};

    fn sample(event_type: EventType) -> Event {
        Event::new(event_type, EventSeverity::Info, "test").namespace("app")
    }

    /// Poll until the condition holds or a second has passed.
    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    fn recording_handler() -> (EventHandler, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let h = handler(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
            }
        });
        (h, seen)
    }

    // ── delivery ──

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let bus = EventBus::start(16);
        let (h, seen) = recording_handler();
        bus.subscribe("rec", h);

        bus.publish(sample(EventType::ResourceOptimized));

        assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let bus = EventBus::start(16);
        let (h1, seen1) = recording_handler();
        let (h2, seen2) = recording_handler();
        bus.subscribe("a", h1);
        bus.subscribe("b", h2);

        bus.publish(sample(EventType::ResourceOptimized));

        assert!(wait_until(|| seen1.lock().unwrap().len() == 1).await);
        assert!(wait_until(|| seen2.lock().unwrap().len() == 1).await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_per_subscriber_order_matches_publication() {
        let bus = EventBus::start(64);
        let (h, seen) = recording_handler();
        bus.subscribe("rec", h);

        for i in 0..10 {
            bus.publish(
                Event::new(EventType::ResourceOptimized, EventSeverity::Info, format!("{i}")),
            );
        }

        assert!(wait_until(|| seen.lock().unwrap().len() == 10).await);
        let messages: Vec<String> = seen.lock().unwrap().iter().map(|e| e.message.clone()).collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(messages, expected);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_filtered_subscription_skips_non_matching() {
        let bus = EventBus::start(16);
        let (h, seen) = recording_handler();
        bus.subscribe_filtered(
            "only-node",
            EventFilter::any().event_types([EventType::NodePressure]),
            h,
        );

        bus.publish(sample(EventType::ResourceOptimized));
        bus.publish(sample(EventType::NodePressure));

        assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);
        assert_eq!(
            seen.lock().unwrap()[0].event_type,
            EventType::NodePressure
        );
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::start(16);
        let (h, seen) = recording_handler();
        bus.subscribe("rec", h);

        bus.publish(sample(EventType::ResourceOptimized));
        assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);

        bus.unsubscribe("rec");
        bus.publish(sample(EventType::ResourceOptimized));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let bus = EventBus::start(4);
        bus.unsubscribe("never-registered");
        bus.stop().await;
    }

    // ── channel sinks ──

    #[tokio::test]
    async fn test_subscribe_channel_delivers_matching() {
        let bus = EventBus::start(16);
        let (tx, mut rx) = mpsc::channel(8);
        bus.subscribe_channel(
            EventFilter::any().event_types([EventType::ResourcePredictedOom]),
            tx,
        );

        bus.publish(sample(EventType::ResourceOptimized));
        bus.publish(sample(EventType::ResourcePredictedOom));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("should receive")
            .expect("channel open");
        assert_eq!(got.event_type, EventType::ResourcePredictedOom);
        bus.stop().await;
    }

    // ── panics and stop ──

    #[tokio::test]
    async fn test_panicking_handler_does_not_poison_others() {
        let bus = EventBus::start(16);
        bus.subscribe(
            "bad",
            handler(|_| async { panic!("handler blew up") }),
        );
        let (h, seen) = recording_handler();
        bus.subscribe("good", h);

        bus.publish(sample(EventType::ResourceOptimized));
        bus.publish(sample(EventType::ResourceOptimized));

        assert!(wait_until(|| seen.lock().unwrap().len() == 2).await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_publish_after_stop_is_silent_noop() {
        let bus = EventBus::start(16);
        let (h, seen) = recording_handler();
        bus.subscribe("rec", h);

        bus.stop().await;
        bus.publish(sample(EventType::ResourceOptimized));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_subscribers() {
        let bus = EventBus::start(16);
        let (h, _) = recording_handler();
        bus.subscribe("rec", h);
        assert_eq!(bus.stats().subscribers, 1);

        bus.stop().await;
        assert_eq!(bus.stats().subscribers, 0);
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_stop_twice_is_safe() {
        let bus = EventBus::start(4);
        bus.stop().await;
        bus.stop().await;
    }

    // ── publish_async and stats ──

    #[tokio::test]
    async fn test_publish_async_delivers() {
        let bus = EventBus::start(16);
        let (h, seen) = recording_handler();
        bus.subscribe("rec", h);

        bus.publish_async(sample(EventType::ResourceOptimized));

        assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let bus = EventBus::start(32);
        let (h, _) = recording_handler();
        bus.subscribe("a", h.clone());
        bus.subscribe("b", h);

        let stats = bus.stats();
        assert_eq!(stats.subscribers, 2);
        assert_eq!(stats.buffer_size, 32);
        assert_eq!(stats.buffer_used + stats.buffer_free, 32);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_same_id_replaces() {
        let bus = EventBus::start(16);
        let (h1, seen1) = recording_handler();
        let (h2, seen2) = recording_handler();
        bus.subscribe("rec", h1);
        bus.subscribe("rec", h2);
        assert_eq!(bus.stats().subscribers, 1);

        bus.publish(sample(EventType::ResourceOptimized));

        assert!(wait_until(|| seen2.lock().unwrap().len() == 1).await);
        assert!(seen1.lock().unwrap().is_empty());
        bus.stop().await;
    }
}
