use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube_rightsize::bus::{handler, EventBus};
use kube_rightsize::events::{Event, EventFilter, EventSeverity, EventType};

// ══════════════════════════════════════════════════════════════════
// Event-fabric integration tests
//
// Exercises publication, filtered channel subscriptions, JSON across a
// sink boundary, and stop semantics the way components use the bus.
// ══════════════════════════════════════════════════════════════════

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn resize_event(namespace: &str, pod: &str) -> Event {
    Event::new(
        EventType::ResourceOptimized,
        EventSeverity::Info,
        format!("resized {pod}"),
    )
    .namespace(namespace)
    .resource(format!("pod/{pod}"))
    .tag("resize")
}

#[tokio::test]
async fn test_multiple_filtered_channels_see_disjoint_streams() {
    let bus = EventBus::start(64);

    let (optimized_tx, mut optimized_rx) = tokio::sync::mpsc::channel(16);
    let (alerts_tx, mut alerts_rx) = tokio::sync::mpsc::channel(16);

    bus.subscribe_channel(
        EventFilter::any().event_types([EventType::ResourceOptimized]),
        optimized_tx,
    );
    bus.subscribe_channel(
        EventFilter::any().severities([EventSeverity::Critical]),
        alerts_tx,
    );

    bus.publish(resize_event("app", "web-1"));
    bus.publish(Event::new(
        EventType::NodePredictedFailure,
        EventSeverity::Critical,
        "node pressure",
    ));

    let optimized = tokio::time::timeout(Duration::from_secs(1), optimized_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(optimized.event_type, EventType::ResourceOptimized);

    let alert = tokio::time::timeout(Duration::from_secs(1), alerts_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.severity, EventSeverity::Critical);

    // Neither stream saw the other's event.
    assert!(optimized_rx.try_recv().is_err());
    assert!(alerts_rx.try_recv().is_err());

    bus.stop().await;
}

#[tokio::test]
async fn test_events_survive_json_sink_boundary() {
    let bus = EventBus::start(64);
    let serialized: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // An external-sink bridge: everything it sees goes out as JSON.
    let sink = serialized.clone();
    bus.subscribe(
        "json-bridge",
        handler(move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.to_json().unwrap());
            }
        }),
    );

    let original = resize_event("app", "web-1").detail("cpuRequestAfterMilli", 216);
    bus.publish(original.clone());

    assert!(wait_until(|| !serialized.lock().unwrap().is_empty()).await);

    let json = serialized.lock().unwrap()[0].clone();
    let decoded = Event::from_json(&json).unwrap();
    assert_eq!(decoded, original);
    assert!(json.contains("\"clusterId\""));
    assert!(json.contains("\"resource.optimized\""));

    bus.stop().await;
}

#[tokio::test]
async fn test_namespace_and_pod_filters_compose() {
    let bus = EventBus::start(64);
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);

    bus.subscribe_channel(
        EventFilter::any()
            .namespaces(["app".to_string()])
            .pod_names(["web-1".to_string()]),
        tx,
    );

    bus.publish(resize_event("app", "web-2"));
    bus.publish(resize_event("other", "web-1"));
    bus.publish(resize_event("app", "web-1"));

    let matched = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(matched.resource.as_deref(), Some("pod/web-1"));
    assert_eq!(matched.namespace.as_deref(), Some("app"));
    assert!(rx.try_recv().is_err());

    bus.stop().await;
}

#[tokio::test]
async fn test_required_tags_narrow_subscription() {
    let bus = EventBus::start(64);
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);

    bus.subscribe_channel(EventFilter::any().require_tag("resize"), tx);

    bus.publish(Event::new(
        EventType::SystemStarted,
        EventSeverity::Info,
        "untagged",
    ));
    bus.publish(resize_event("app", "web-1"));

    let matched = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matched.tags.contains("resize"));
    assert!(rx.try_recv().is_err());

    bus.stop().await;
}

#[tokio::test]
async fn test_stop_silences_all_delivery() {
    let bus = EventBus::start(64);
    let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    bus.subscribe(
        "observer",
        handler(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
            }
        }),
    );

    bus.publish(resize_event("app", "web-1"));
    assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);

    bus.stop().await;

    // Anything published after stop() reaches no handler.
    for i in 0..10 {
        bus.publish(resize_event("app", &format!("late-{i}")));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(bus.stats().subscribers, 0);
}

#[tokio::test]
async fn test_stats_reflect_load() {
    let bus = EventBus::start(8);
    let stats = bus.stats();
    assert_eq!(stats.buffer_size, 8);
    assert_eq!(stats.buffer_used + stats.buffer_free, 8);
    bus.stop().await;
}
