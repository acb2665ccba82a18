use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::ConfigStore;
use crate::events::{Event, EventSeverity, EventType, PredictiveDetails};
use crate::metrics::{MetricsProvider, NodeMetricsSource, NodeUsage, Usage};
use crate::recommendations::{NewRecommendation, RecommendationManager, Urgency};
use crate::resources::{ContainerResources, ResourceAmounts};

/* ============================= CONSTANTS ============================= */

const HORIZONS: [Duration; 3] = [
    Duration::from_secs(300),
    Duration::from_secs(900),
    Duration::from_secs(3600),
];

const PREDICTED_BREACH_RATIO: f64 = 0.95;
const IMMEDIATE_USAGE_RATIO: f64 = 0.8;
const NODE_PRESSURE_RATIO: f64 = 0.85;

const IMMEDIATE_SUPPRESSION: Duration = Duration::from_secs(600);
const PREDICTIVE_SUPPRESSION: Duration = Duration::from_secs(1800);

const MIN_SAMPLES: usize = 5;
const MAX_SAMPLES: usize = 240;
const SAMPLE_RETENTION: Duration = Duration::from_secs(7200);

/* ============================= SERIES STORE ============================= */

/// Bounded per-key time series of usage samples.
#[derive(Debug, Default)]
pub struct SeriesStore {
    series: HashMap<String, Vec<(DateTime<Utc>, f64)>>,
}

impl SeriesStore {
    pub fn append(&mut self, key: &str, at: DateTime<Utc>, value: f64) {
        let samples = self.series.entry(key.to_string()).or_default();
        samples.push((at, value));

        let horizon = at - chrono::Duration::from_std(SAMPLE_RETENTION).unwrap_or_default();
        samples.retain(|(t, _)| *t >= horizon);
        if samples.len() > MAX_SAMPLES {
            let excess = samples.len() - MAX_SAMPLES;
            samples.drain(..excess);
        }
    }

    pub fn get(&self, key: &str) -> &[(DateTime<Utc>, f64)] {
        self.series.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/* ============================= REGRESSION ============================= */

/// A point prediction at some horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub value: f64,
    pub confidence: f64,
    pub method: &'static str,
}

/// Least-squares linear fit over the series, extrapolated `horizon` past
/// the newest sample. Confidence is the r² of the fit. Needs enough
/// samples and a non-degenerate time spread.
pub fn predict_linear(
    samples: &[(DateTime<Utc>, f64)],
    horizon: Duration,
) -> Option<Prediction> {
    if samples.len() < MIN_SAMPLES {
        return None;
    }

    let t0 = samples[0].0;
    let xs: Vec<f64> = samples
        .iter()
        .map(|(t, _)| (*t - t0).num_milliseconds() as f64 / 1000.0)
        .collect();
    let ys: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut ss_xx = 0.0;
    let mut ss_xy = 0.0;
    let mut ss_yy = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        ss_xx += (x - mean_x) * (x - mean_x);
        ss_xy += (x - mean_x) * (y - mean_y);
        ss_yy += (y - mean_y) * (y - mean_y);
    }
    if ss_xx == 0.0 {
        return None;
    }

    let slope = ss_xy / ss_xx;
    let intercept = mean_y - slope * mean_x;

    // A flat series predicts itself perfectly.
    let confidence = if ss_yy == 0.0 {
        1.0
    } else {
        ((ss_xy * ss_xy) / (ss_xx * ss_yy)).clamp(0.0, 1.0)
    };

    let last_x = *xs.last().expect("non-empty samples");
    let future_x = last_x + horizon.as_secs_f64();

    Some(Prediction {
        value: slope * future_x + intercept,
        confidence,
        method: "linear_regression",
    })
}

/// Render a duration the way operators read horizons: "15m0s", "1h0m0s".
pub fn format_horizon(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/* ============================= DEDUPLICATION ============================= */

/// Suppresses repeated alerts keyed by `(type, namespace, resource,
/// message)` within a per-class window.
#[derive(Debug, Default)]
pub struct AlertDeduper {
    last_emitted: HashMap<String, DateTime<Utc>>,
}

impl AlertDeduper {
    /// True when the alert may fire; records the emission time if so.
    pub fn admit(
        &mut self,
        event_type: EventType,
        namespace: &str,
        resource: &str,
        message: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let key = format!("{}|{namespace}|{resource}|{message}", event_type.as_str());
        if let Some(last) = self.last_emitted.get(&key) {
            let elapsed = (now - *last).to_std().unwrap_or_default();
            if elapsed < window {
                return false;
            }
        }
        self.last_emitted.insert(key, now);
        true
    }
}

/* ============================= MONITOR ============================= */

/// Samples usage trends, predicts resource exhaustion, and turns likely
/// incidents into events and pending recommendations.
pub struct PredictiveMonitor {
    config: Arc<ConfigStore>,
    bus: EventBus,
    recommendations: Arc<RecommendationManager>,
    series: Mutex<SeriesStore>,
    deduper: Mutex<AlertDeduper>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PredictiveMonitor {
    pub fn new(
        config: Arc<ConfigStore>,
        bus: EventBus,
        recommendations: Arc<RecommendationManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            recommendations,
            series: Mutex::new(SeriesStore::default()),
            deduper: Mutex::new(AlertDeduper::default()),
            task: Mutex::new(None),
        })
    }

    /// Feed one container sample: store the series point, apply immediate
    /// rules, then the predictive rules. Returns the events it published.
    pub fn observe_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        usage: &Usage,
        limits: ResourceAmounts,
        now: DateTime<Utc>,
    ) -> Vec<Event> {
        let mut emitted = Vec::new();
        let resource = format!("pod/{pod}");

        {
            let mut series = self.series.lock().expect("monitor lock poisoned");
            series.append(
                &format!("{namespace}/{pod}/{container}/memory"),
                now,
                usage.memory_mib,
            );
            series.append(
                &format!("{namespace}/{pod}/{container}/cpu"),
                now,
                usage.cpu_milli,
            );
        }

        // ── immediate rules ──
        if let Some(limit) = limits.memory_mib
            && limit > 0
            && usage.memory_mib / limit as f64 > IMMEDIATE_USAGE_RATIO
        {
            // Messages double as deduplication keys and stay value-free;
            // the numbers live in the details map.
            let message = format!("memory usage above 80% of the {limit}Mi limit");
            if self.admit(
                EventType::ResourcePredictedOom,
                namespace,
                &resource,
                &message,
                IMMEDIATE_SUPPRESSION,
                now,
            ) {
                emitted.push(self.alert(
                    EventType::ResourcePredictedOom,
                    EventSeverity::Warning,
                    namespace,
                    &resource,
                    message,
                    None,
                ));
            }
        }
        if let Some(limit) = limits.cpu_milli
            && limit > 0
            && usage.cpu_milli / limit as f64 > IMMEDIATE_USAGE_RATIO
        {
            let message = format!("cpu usage above 80% of the {limit}m limit");
            if self.admit(
                EventType::PodPredictedFailure,
                namespace,
                &resource,
                &message,
                IMMEDIATE_SUPPRESSION,
                now,
            ) {
                emitted.push(self.alert(
                    EventType::PodPredictedFailure,
                    EventSeverity::Warning,
                    namespace,
                    &resource,
                    message,
                    None,
                ));
            }
        }

        // ── predictive rules ──
        let alert_threshold = self.config.snapshot().alert_threshold;

        if let Some(limit) = limits.memory_mib
            && limit > 0
        {
            emitted.extend(self.predict_breach(
                namespace,
                pod,
                container,
                "memory",
                limit,
                alert_threshold,
                now,
            ));
        }
        if let Some(limit) = limits.cpu_milli
            && limit > 0
        {
            emitted.extend(self.predict_breach(
                namespace,
                pod,
                container,
                "cpu",
                limit,
                alert_threshold,
                now,
            ));
        }

        emitted
    }

    /// Node-level pressure rule.
    pub fn observe_node(&self, node: &NodeUsage, now: DateTime<Utc>) -> Vec<Event> {
        let mut emitted = Vec::new();
        for (kind, usage, capacity) in [
            ("cpu", node.cpu_milli, node.cpu_capacity_milli),
            ("memory", node.memory_mib, node.memory_capacity_mib),
        ] {
            if capacity <= 0.0 {
                continue;
            }
            let ratio = usage / capacity;
            if ratio <= NODE_PRESSURE_RATIO {
                continue;
            }
            let resource = format!("node/{}", node.name);
            let message = format!("node {kind} at {:.0}% of capacity", ratio * 100.0);
            if self.admit(
                EventType::NodePredictedFailure,
                "",
                &resource,
                &message,
                IMMEDIATE_SUPPRESSION,
                now,
            ) {
                emitted.push(self.alert(
                    EventType::NodePredictedFailure,
                    EventSeverity::Critical,
                    "",
                    &resource,
                    message,
                    None,
                ));
            }
        }
        emitted
    }

    #[allow(clippy::too_many_arguments)]
    fn predict_breach(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        kind: &str,
        limit: u64,
        alert_threshold: f64,
        now: DateTime<Utc>,
    ) -> Vec<Event> {
        let key = format!("{namespace}/{pod}/{container}/{kind}");
        let mut emitted = Vec::new();

        for horizon in HORIZONS {
            let prediction = {
                let series = self.series.lock().expect("monitor lock poisoned");
                predict_linear(series.get(&key), horizon)
            };
            let Some(prediction) = prediction else { continue };

            if prediction.value / limit as f64 <= PREDICTED_BREACH_RATIO
                || prediction.confidence < alert_threshold
            {
                continue;
            }

            let horizon_label = format_horizon(horizon);
            let resource = format!("pod/{pod}");
            let (event_type, action, unit) = if kind == "memory" {
                (EventType::ResourcePredictedOom, "increase_memory_limit", "Mi")
            } else {
                (EventType::ResourceExhaustion, "increase_cpu_limit", "m")
            };
            let message =
                format!("{kind} predicted to exceed the {limit}{unit} limit within {horizon_label}");

            if !self.admit(
                event_type,
                namespace,
                &resource,
                &message,
                PREDICTIVE_SUPPRESSION,
                now,
            ) {
                // A nearer horizon already alerted recently; farther
                // horizons must not re-raise the same breach.
                break;
            }

            let event = self.alert(
                event_type,
                EventSeverity::Warning,
                namespace,
                &resource,
                message.clone(),
                Some(PredictiveDetails {
                    predicted_value: prediction.value,
                    current_limit: limit as f64,
                    confidence: prediction.confidence,
                    method: prediction.method.to_string(),
                    time_to_event: horizon_label.clone(),
                }),
            );

            self.recommendations.create(NewRecommendation {
                event_id: event.id.clone(),
                resource_type: "pod".to_string(),
                resource_name: pod.to_string(),
                namespace: namespace.to_string(),
                title: format!("Increase {kind} limit for {pod}/{container}"),
                description: message,
                action: action.to_string(),
                urgency: Urgency::High,
                severity: EventSeverity::Warning,
                confidence: prediction.confidence,
                time_to_action: horizon,
                ..Default::default()
            });

            emitted.push(event);
            // One alert per resource per tick; nearer horizons win.
            break;
        }

        emitted
    }

    fn admit(
        &self,
        event_type: EventType,
        namespace: &str,
        resource: &str,
        message: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.deduper
            .lock()
            .expect("monitor lock poisoned")
            .admit(event_type, namespace, resource, message, window, now)
    }

    fn alert(
        &self,
        event_type: EventType,
        severity: EventSeverity,
        namespace: &str,
        resource: &str,
        message: String,
        details: Option<PredictiveDetails>,
    ) -> Event {
        let mut event = Event::new(event_type, severity, message).resource(resource);
        if !namespace.is_empty() {
            event = event.namespace(namespace);
        }
        if let Some(details) = details {
            event = event.details_from(details);
        }
        self.bus.publish(event.clone());
        event
    }

    /// Start the sampling loop against the cluster.
    pub fn start(
        self: Arc<Self>,
        client: Client,
        provider: Arc<dyn MetricsProvider>,
        node_source: Option<Arc<dyn NodeMetricsSource>>,
    ) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let interval = monitor.config.snapshot().check_interval;
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                monitor.tick(&client, provider.as_ref(), node_source.as_deref()).await;
            }
        });
        *self.task.lock().expect("monitor lock poisoned") = Some(handle);
    }

    async fn tick(
        &self,
        client: &Client,
        provider: &dyn MetricsProvider,
        node_source: Option<&dyn NodeMetricsSource>,
    ) {
        let settings = self.config.snapshot();
        let now = Utc::now();

        let pods: Api<Pod> = Api::all(client.clone());
        let pod_list = match pods.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "predictive_pod_list_failed");
                return;
            }
        };

        for pod in &pod_list.items {
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
            if !settings.is_namespace_included(namespace) {
                continue;
            }
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };

            let usage = match provider.fetch_pod_usage(namespace, name).await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!(pod = %name, error = %e, "predictive_usage_fetch_failed");
                    continue;
                }
            };

            let Some(spec) = &pod.spec else { continue };
            for container in &spec.containers {
                let limits = container
                    .resources
                    .as_ref()
                    .and_then(|r| ContainerResources::from_k8s(r).ok())
                    .map(|c| c.limits)
                    .unwrap_or_default();
                self.observe_container(namespace, name, &container.name, &usage, limits, now);
            }
        }

        if let Some(source) = node_source {
            match source.list_node_usage().await {
                Ok(nodes) => {
                    for node in &nodes {
                        self.observe_node(node, now);
                    }
                }
                Err(e) => warn!(error = %e, "predictive_node_list_failed"),
            }
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("monitor lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for PredictiveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/* ============================= TESTS ============================= */
