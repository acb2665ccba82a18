use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{ConfigStore, Settings};
use crate::crd::{RightSizerPolicy, RightSizerPolicyStatus};
use crate::events::{Event, EventSeverity, EventType, ResourceChangeDetails};
use crate::executor::{ResizeExecutor, ResizeOutcome};
use crate::health::SharedHealth;
use crate::metrics::cache::CachedMetricsProvider;
use crate::metrics::{MetricsProvider, Usage};
use crate::policy::{self, WorkloadMeta};
use crate::recommend::{recommend, Proposal, ResizeDirection, SizingOutcome};
use crate::recommendations::{NewRecommendation, RecommendationManager, Urgency};
use crate::resources::{qos_class, ContainerResources};
use crate::retry::Backoff;
use crate::validation::{self, resize_policy_info, ClusterInspector, ValidationContext};

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Registry backing the `/metrics` endpoint.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

static PODS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rightsize_pods_processed_total",
        "Pods evaluated across all reconcile ticks",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static PODS_RESIZED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("rightsize_pods_resized_total", "Successful in-place resizes"),
        &["namespace", "resize_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static PODS_SKIPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("rightsize_pods_skipped_total", "Pods skipped, by reason"),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static PROCESSING_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rightsize_processing_errors_total",
            "Errors while processing pods, by error type",
        ),
        &["error_type"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SAFETY_VIOLATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rightsize_safety_threshold_violations_total",
        "Proposals rejected by the safety gate",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RETRY_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("rightsize_retry_attempts_total", "Retries, by operation"),
        &["operation", "attempt"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static RETRY_SUCCESS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rightsize_retry_success_total",
            "Operations that succeeded after retrying",
        ),
        &["operation"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static TICK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "rightsize_reconcile_tick_duration_seconds",
        "Duration of each reconcile tick",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Force-init every metric so an empty scrape still lists them.
pub fn force_metrics() {
    LazyLock::force(&PODS_PROCESSED);
    LazyLock::force(&PODS_RESIZED);
    LazyLock::force(&PODS_SKIPPED);
    LazyLock::force(&PROCESSING_ERRORS);
    LazyLock::force(&SAFETY_VIOLATIONS);
    LazyLock::force(&RETRY_ATTEMPTS);
    LazyLock::force(&RETRY_SUCCESS);
    LazyLock::force(&TICK_DURATION);
}

/* ============================= PURE HELPERS ============================= */

/// Resolve the parent workload from a pod's owner references. ReplicaSet
/// owners map back to their Deployment by stripping the template hash.
pub fn workload_meta_for(pod: &Pod) -> WorkloadMeta {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let fallback_name = pod.name_any();

    if let Some(owners) = &pod.metadata.owner_references {
        for owner in owners {
            match owner.kind.as_str() {
                "Deployment" | "StatefulSet" | "DaemonSet" | "Job" => {
                    return WorkloadMeta {
                        namespace,
                        kind: owner.kind.clone(),
                        name: owner.name.clone(),
                        labels,
                    };
                }
                "ReplicaSet" => {
                    return WorkloadMeta {
                        namespace,
                        kind: "Deployment".to_string(),
                        name: strip_replicaset_hash(&owner.name),
                        labels,
                    };
                }
                _ => continue,
            }
        }
    }

    WorkloadMeta {
        namespace,
        kind: "Pod".to_string(),
        name: fallback_name,
        labels,
    }
}

/// `"web-app-5d4f8b9c7f"` becomes `"web-app"`.
pub fn strip_replicaset_hash(rs_name: &str) -> String {
    match rs_name.rfind('-') {
        Some(pos) if pos > 0 => rs_name[..pos].to_string(),
        _ => rs_name.to_string(),
    }
}

/// Attribute pod-level usage to containers, proportionally to their share
/// of declared limits. Containers without limits split evenly; a single
/// container receives everything.
pub fn split_usage(usage: &Usage, containers: &[ContainerResources]) -> Vec<Usage> {
    if containers.len() <= 1 {
        return vec![*usage];
    }

    let total_cpu: u64 = containers.iter().filter_map(|c| c.limits.cpu_milli).sum();
    let total_memory: u64 = containers.iter().filter_map(|c| c.limits.memory_mib).sum();
    let even = 1.0 / containers.len() as f64;

    containers
        .iter()
        .map(|c| {
            let cpu_share = match c.limits.cpu_milli {
                Some(limit) if total_cpu > 0 => limit as f64 / total_cpu as f64,
                _ => even,
            };
            let memory_share = match c.limits.memory_mib {
                Some(limit) if total_memory > 0 => limit as f64 / total_memory as f64,
                _ => even,
            };
            let mut split = *usage;
            split.cpu_milli = usage.cpu_milli * cpu_share;
            split.memory_mib = usage.memory_mib * memory_share;
            split
        })
        .collect()
}

/// Event type for a sizing decision.
pub fn event_type_for(direction: ResizeDirection, usage_over_limit: bool) -> EventType {
    if usage_over_limit {
        EventType::ResourceExhaustion
    } else {
        match direction {
            ResizeDirection::Down => EventType::ResourceUnderutilized,
            _ => EventType::ResourceOptimized,
        }
    }
}

/// True when usage already exceeds a declared limit.
pub fn usage_over_limit(usage: &Usage, current: &ContainerResources) -> bool {
    let cpu_over = current
        .limits
        .cpu_milli
        .is_some_and(|limit| limit > 0 && usage.cpu_milli >= limit as f64);
    let memory_over = current
        .limits
        .memory_mib
        .is_some_and(|limit| limit > 0 && usage.memory_mib >= limit as f64);
    cpu_over || memory_over
}

fn change_details(proposal: &Proposal, status: &str) -> ResourceChangeDetails {
    ResourceChangeDetails {
        container: proposal.container.clone(),
        cpu_request_before_milli: proposal.current.requests.cpu_milli,
        cpu_request_after_milli: proposal.desired.requests.cpu_milli,
        cpu_limit_before_milli: proposal.current.limits.cpu_milli,
        cpu_limit_after_milli: proposal.desired.limits.cpu_milli,
        memory_request_before_mib: proposal.current.requests.memory_mib,
        memory_request_after_mib: proposal.desired.requests.memory_mib,
        memory_limit_before_mib: proposal.current.limits.memory_mib,
        memory_limit_after_mib: proposal.desired.limits.memory_mib,
        reason: proposal.reason.clone(),
        status: status.to_string(),
    }
}

/// Pods (by workload metadata) a policy's target currently matches.
pub fn matched_pod_count(policy: &RightSizerPolicy, metas: &[WorkloadMeta]) -> u32 {
    if !policy.spec.enabled.unwrap_or(true) {
        return 0;
    }
    metas
        .iter()
        .filter(|meta| {
            policy
                .spec
                .target_ref
                .as_ref()
                .is_none_or(|target| policy::target_matches(target, meta))
        })
        .count() as u32
}

/// Recommendation action derived from validation errors.
pub fn remediation_action_for(errors: &[String]) -> &'static str {
    if errors.iter().any(|e| e.contains("cpu")) {
        "increase_cpu_limit"
    } else if errors.iter().any(|e| e.contains("memory")) {
        "increase_memory_limit"
    } else {
        "manual_review"
    }
}

/* ============================= RECONCILER ============================= */

/// The periodic control loop driving policy resolution, recommendation,
/// validation, and execution for every candidate pod.
pub struct Reconciler {
    client: Client,
    config: Arc<ConfigStore>,
    bus: EventBus,
    provider: Arc<CachedMetricsProvider>,
    inspector: Arc<ClusterInspector>,
    executor: Arc<ResizeExecutor>,
    recommendations: Arc<RecommendationManager>,
    health: SharedHealth,

    pod_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    last_resized: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        config: Arc<ConfigStore>,
        bus: EventBus,
        provider: Arc<CachedMetricsProvider>,
        inspector: Arc<ClusterInspector>,
        executor: Arc<ResizeExecutor>,
        recommendations: Arc<RecommendationManager>,
        health: SharedHealth,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            client,
            config,
            bus,
            provider,
            inspector,
            executor,
            recommendations,
            health,
            pod_locks: Mutex::new(HashMap::new()),
            last_resized: Mutex::new(HashMap::new()),
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Start the periodic loop.
    pub fn start(self: Arc<Self>) {
        force_metrics();
        let reconciler = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let interval = reconciler.config.snapshot().resize_interval;
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("reconciler_stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let _timer = TICK_DURATION.start_timer();
                        reconciler.tick().await;
                    }
                }
            }
        });
        *self.task.lock().expect("reconciler lock poisoned") = Some(handle);
    }

    /// Stop the loop; in-flight work gets a bounded grace period.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().expect("reconciler lock poisoned").take();
        if let Some(handle) = handle
            && tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
        {
            warn!("reconciler_stop_timed_out");
        }
    }

    /// One full pass over the cluster: enumerate candidates, then walk
    /// them through metrics, policy, recommendation, validation, and
    /// execution in bounded batches.
    pub async fn tick(&self) {
        let settings = self.config.snapshot();
        let policies = self.list_policies().await;

        let pods: Api<Pod> = Api::all(self.client.clone());
        let pod_list = match pods.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "pod_list_failed");
                PROCESSING_ERRORS.with_label_values(&["pod_list"]).inc();
                return;
            }
        };

        let mut candidates = Vec::new();
        for pod in pod_list.items {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            if !settings.is_namespace_included(&namespace) {
                let reason = if settings
                    .system_namespace_exclude
                    .iter()
                    .any(|ns| *ns == namespace)
                {
                    "system_namespace"
                } else {
                    "namespace_excluded"
                };
                PODS_SKIPPED.with_label_values(&[reason]).inc();
                continue;
            }
            let running = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running");
            if !running {
                PODS_SKIPPED.with_label_values(&["not_running"]).inc();
                continue;
            }
            candidates.push(pod);
        }

        debug!(candidates = candidates.len(), "reconcile_tick_started");

        let metas: Vec<WorkloadMeta> = candidates.iter().map(workload_meta_for).collect();
        self.update_policy_statuses(&policies, &metas).await;

        let semaphore = Arc::new(Semaphore::new(
            settings.max_concurrent_reconciles.max(1) as usize,
        ));
        let mut shutdown = self.shutdown.subscribe();

        for batch in candidates.chunks(settings.batch_size.max(1) as usize) {
            if *shutdown.borrow() {
                return;
            }

            let mut work = Vec::new();
            for (index, pod) in batch.iter().cloned().enumerate() {
                let semaphore = semaphore.clone();
                let stagger = settings.delay_between_pods * index as u32;
                let settings = &settings;
                let policies = &policies;
                work.push(async move {
                    tokio::time::sleep(stagger).await;
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    self.process_pod(&pod, settings, policies).await;
                });
            }

            tokio::select! {
                _ = futures::future::join_all(work) => {}
                _ = shutdown.changed() => {
                    warn!("reconcile_batch_aborted_for_shutdown");
                    return;
                }
            }

            tokio::time::sleep(settings.delay_between_batches).await;
        }
    }

    /// Report how many candidate pods each policy currently matches.
    async fn update_policy_statuses(
        &self,
        policies: &[RightSizerPolicy],
        metas: &[WorkloadMeta],
    ) {
        for policy in policies {
            let (Some(name), Some(namespace)) = (
                policy.metadata.name.as_deref(),
                policy.metadata.namespace.as_deref(),
            ) else {
                continue;
            };

            let matched = matched_pod_count(policy, metas);
            let status = RightSizerPolicyStatus {
                observed_generation: policy.metadata.generation,
                matched_pods: Some(matched),
                last_evaluated: Some(Utc::now().to_rfc3339()),
                message: Some(format!("{matched} candidate pods matched")),
            };

            let api: Api<RightSizerPolicy> = Api::namespaced(self.client.clone(), namespace);
            if let Err(e) = api
                .patch_status(
                    name,
                    &PatchParams::apply("kube-rightsize"),
                    &Patch::Merge(&serde_json::json!({ "status": status })),
                )
                .await
            {
                debug!(policy = %name, error = %e, "policy_status_update_failed");
            }
        }
    }

    async fn list_policies(&self) -> Arc<Vec<RightSizerPolicy>> {
        let api: Api<RightSizerPolicy> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => Arc::new(list.items),
            Err(e) => {
                debug!(error = %e, "policy_list_failed_using_defaults");
                Arc::new(Vec::new())
            }
        }
    }

    /// Decide and (maybe) act for one pod. Same-pod decisions are
    /// serialized through a per-pod key lock.
    async fn process_pod(
        &self,
        pod: &Pod,
        settings: &Settings,
        policies: &[RightSizerPolicy],
    ) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.name_any();
        let pod_key = format!("{namespace}/{name}");

        let lock = self.pod_lock(&pod_key);
        let _guard = lock.lock().await;

        PODS_PROCESSED.inc();

        // ── metrics ──
        let usage = match self.provider.fetch_pod_usage(&namespace, &name).await {
            Ok(usage) => usage,
            Err(e) => {
                debug!(pod = %pod_key, error = %e, "metrics_unavailable_skipping");
                PODS_SKIPPED.with_label_values(&["metrics_unavailable"]).inc();
                return;
            }
        };
        self.health.lock().expect("health lock poisoned").metrics_fetched = true;

        let stale_after = settings.metrics_cache_ttl * 2;
        let age = (Utc::now() - usage.observed_at).to_std().unwrap_or_default();
        if age > stale_after {
            PODS_SKIPPED.with_label_values(&["metrics_stale"]).inc();
            return;
        }

        // ── current shape ──
        let Some(spec) = &pod.spec else { return };
        let mut containers: Vec<(String, ContainerResources)> = Vec::new();
        for container in &spec.containers {
            let current = match container
                .resources
                .as_ref()
                .map(ContainerResources::from_k8s)
                .transpose()
            {
                Ok(current) => current.unwrap_or_default(),
                Err(e) => {
                    warn!(pod = %pod_key, error = %e, "container_quantities_unparseable");
                    PROCESSING_ERRORS
                        .with_label_values(&["quantity_parse"])
                        .inc();
                    return;
                }
            };
            containers.push((container.name.clone(), current));
        }

        // ── policy ──
        let meta = workload_meta_for(pod);
        let strategy = match policy::resolve(policies, &meta, settings) {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(pod = %pod_key, error = %e, "policy_resolution_failed_using_defaults");
                PROCESSING_ERRORS.with_label_values(&["policy_parse"]).inc();
                policy::EffectiveStrategy::from_settings(settings)
            }
        };

        let shapes: Vec<ContainerResources> = containers.iter().map(|(_, c)| *c).collect();
        let pod_qos = qos_class(&shapes);
        let usages = split_usage(&usage, &shapes);

        for ((container, current), container_usage) in containers.iter().zip(usages.iter()) {
            let container_key = format!("{pod_key}/{container}");
            let last_resized = self.last_resized_at(&container_key);

            let outcome = recommend(
                container,
                container_usage,
                current,
                &strategy,
                pod_qos,
                last_resized,
                Utc::now(),
            );

            let proposal = match outcome {
                SizingOutcome::Skip(reason) => {
                    PODS_SKIPPED.with_label_values(&[reason.as_str()]).inc();
                    debug!(pod = %pod_key, container = %container, reason = reason.as_str(), "no_resize_needed");
                    continue;
                }
                SizingOutcome::Resize(proposal) => proposal,
            };

            self.decide_and_execute(
                pod,
                &pod_key,
                &container_key,
                &proposal,
                container_usage,
                &shapes,
                &strategy,
                settings,
            )
            .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide_and_execute(
        &self,
        pod: &Pod,
        pod_key: &str,
        container_key: &str,
        proposal: &Proposal,
        usage: &Usage,
        shapes: &[ContainerResources],
        strategy: &policy::EffectiveStrategy,
        settings: &Settings,
    ) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.name_any();
        let over_limit = usage_over_limit(usage, &proposal.current);
        let event_type = event_type_for(proposal.direction, over_limit);

        // ── validation ──
        let limit_range = match self.inspector.limit_range_for(&namespace).await {
            Ok(bounds) => bounds,
            Err(e) => {
                debug!(pod = %pod_key, error = %e, "limit_range_fetch_failed");
                None
            }
        };
        let node_headroom = match pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            Some(node) => self.inspector.node_headroom(node).await.ok().flatten(),
            None => None,
        };
        let context = ValidationContext {
            limit_range,
            node_headroom,
            resize_supported: self.executor.detect_support().await,
            resize_policy: resize_policy_info(pod, &proposal.container),
        };

        let mut after = shapes.to_vec();
        if let Some(slot) = shapes.iter().position(|shape| *shape == proposal.current) {
            after[slot] = proposal.desired;
        }

        let report =
            validation::validate(proposal, shapes, &after, strategy, settings, &context);

        if !report.is_valid() {
            if report.errors.iter().any(|e| e.contains("safety threshold")) {
                SAFETY_VIOLATIONS.inc();
            }
            PODS_SKIPPED.with_label_values(&["validation_failed"]).inc();

            let event = Event::new(
                event_type,
                EventSeverity::Warning,
                format!(
                    "resize for {pod_key}/{} blocked by validation: {}",
                    proposal.container,
                    report.errors.join("; ")
                ),
            )
            .namespace(namespace.clone())
            .resource(format!("pod/{name}"))
            .details_from(change_details(proposal, "proposed"))
            .detail("validationErrors", report.errors.clone());
            let event_id = event.id.clone();
            self.bus.publish(event);

            self.recommendations.create(NewRecommendation {
                event_id,
                resource_type: "pod".to_string(),
                resource_name: name.clone(),
                namespace: namespace.clone(),
                title: format!("Manual review for {pod_key}/{}", proposal.container),
                description: report.errors.join("; "),
                action: remediation_action_for(&report.errors).to_string(),
                urgency: Urgency::Medium,
                severity: EventSeverity::Warning,
                confidence: 0.8,
                ..Default::default()
            });
            return;
        }
        for warning in &report.warnings {
            debug!(pod = %pod_key, warning = %warning, "validation_warning");
        }

        // ── dry run ──
        if settings.dry_run {
            info!(pod = %pod_key, container = %proposal.container, "dry_run_decision");
            self.bus.publish(
                Event::new(
                    event_type,
                    EventSeverity::Info,
                    format!(
                        "dry-run: would resize {pod_key}/{} ({})",
                        proposal.container, proposal.reason
                    ),
                )
                .namespace(namespace)
                .resource(format!("pod/{name}"))
                .details_from(change_details(proposal, "dryrun")),
            );
            return;
        }

        // ── execution with retry ──
        let mut backoff = Backoff::new(
            settings.retry_interval,
            settings.max_retries,
            settings.resize_interval,
        );
        let mut retried = false;
        let outcome = loop {
            match self
                .executor
                .apply(pod, proposal, settings.safety_timeout)
                .await
            {
                Ok(outcome) => {
                    if retried {
                        RETRY_SUCCESS.with_label_values(&["resize"]).inc();
                    }
                    break Ok(outcome);
                }
                Err(e) if e.is_transient() => {
                    let Some(delay) = backoff.next_delay() else {
                        break Err(e);
                    };
                    retried = true;
                    RETRY_ATTEMPTS
                        .with_label_values(&["resize", &backoff.attempt().to_string()])
                        .inc();
                    warn!(pod = %pod_key, error = %e, attempt = backoff.attempt(), "resize_retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(ResizeOutcome::Applied) => {
                PODS_RESIZED
                    .with_label_values(&[&namespace, proposal.direction.as_str()])
                    .inc();
                self.mark_resized(container_key, Utc::now());
                self.provider.invalidate(&namespace, &name);

                info!(
                    pod = %pod_key,
                    container = %proposal.container,
                    direction = proposal.direction.as_str(),
                    "resize_applied"
                );
                self.bus.publish(
                    Event::new(
                        event_type,
                        EventSeverity::Info,
                        format!("resized {pod_key}/{}: {}", proposal.container, proposal.reason),
                    )
                    .namespace(namespace)
                    .resource(format!("pod/{name}"))
                    .details_from(change_details(proposal, "applied")),
                );
            }
            Ok(ResizeOutcome::Pending) => {
                debug!(pod = %pod_key, "resize_still_pending");
                self.bus.publish(
                    Event::new(
                        event_type,
                        EventSeverity::Info,
                        format!("resize of {pod_key}/{} is pending", proposal.container),
                    )
                    .namespace(namespace)
                    .resource(format!("pod/{name}"))
                    .details_from(change_details(proposal, "pending")),
                );
            }
            Ok(ResizeOutcome::Unsupported) => {
                self.bus.publish(
                    Event::new(
                        event_type,
                        EventSeverity::Info,
                        format!(
                            "proposal only (no in-place resize): {pod_key}/{}",
                            proposal.container
                        ),
                    )
                    .namespace(namespace)
                    .resource(format!("pod/{name}"))
                    .details_from(change_details(proposal, "proposed")),
                );
            }
            Ok(ResizeOutcome::Infeasible(reason)) => {
                warn!(pod = %pod_key, reason = %reason, "resize_infeasible");
                let event = Event::new(
                    EventType::SystemRemediationFailed,
                    EventSeverity::Warning,
                    format!("resize of {pod_key}/{} infeasible: {reason}", proposal.container),
                )
                .namespace(namespace.clone())
                .resource(format!("pod/{name}"))
                .details_from(change_details(proposal, "infeasible"));
                let event_id = event.id.clone();
                self.bus.publish(event);

                self.recommendations.create(NewRecommendation {
                    event_id,
                    resource_type: "pod".to_string(),
                    resource_name: name.clone(),
                    namespace,
                    title: format!("Resize infeasible for {pod_key}/{}", proposal.container),
                    description: reason,
                    action: remediation_action_for(&[proposal.reason.clone()]).to_string(),
                    urgency: Urgency::High,
                    severity: EventSeverity::Warning,
                    confidence: 0.9,
                    ..Default::default()
                });
            }
            Err(e) => {
                PROCESSING_ERRORS.with_label_values(&[e.kind()]).inc();
                warn!(pod = %pod_key, error = %e, "resize_failed");
                self.bus.publish(
                    Event::new(
                        event_type,
                        EventSeverity::Error,
                        format!("resize of {pod_key}/{} failed: {e}", proposal.container),
                    )
                    .namespace(namespace)
                    .resource(format!("pod/{name}"))
                    .details_from(change_details(proposal, "failed"))
                    .detail("errorKind", e.kind()),
                );
            }
        }
    }

    fn pod_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.pod_locks
            .lock()
            .expect("reconciler lock poisoned")
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn last_resized_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_resized
            .lock()
            .expect("reconciler lock poisoned")
            .get(key)
            .copied()
    }

    fn mark_resized(&self, key: &str, at: DateTime<Utc>) {
        self.last_resized
            .lock()
            .expect("reconciler lock poisoned")
            .insert(key.to_string(), at);
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceAmounts;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn pod_with_owner(kind: &str, owner_name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("app".to_string()),
                labels: Some(std::collections::BTreeMap::from([(
                    "tier".to_string(),
                    "web".to_string(),
                )])),
                owner_references: Some(vec![owner(kind, owner_name)]),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    // ── workload resolution ──

    #[test]
    fn test_workload_meta_from_replicaset_owner() {
        let meta = workload_meta_for(&pod_with_owner("ReplicaSet", "web-app-5d4f8b9c7f"));
        assert_eq!(meta.kind, "Deployment");
        assert_eq!(meta.name, "web-app");
        assert_eq!(meta.namespace, "app");
        assert_eq!(meta.labels.get("tier").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_workload_meta_from_statefulset_owner() {
        let meta = workload_meta_for(&pod_with_owner("StatefulSet", "db"));
        assert_eq!(meta.kind, "StatefulSet");
        assert_eq!(meta.name, "db");
    }

    #[test]
    fn test_workload_meta_bare_pod() {
        let mut pod = pod_with_owner("ReplicaSet", "x-1");
        pod.metadata.owner_references = None;
        let meta = workload_meta_for(&pod);
        assert_eq!(meta.kind, "Pod");
        assert_eq!(meta.name, "web-1");
    }

    #[test]
    fn test_strip_replicaset_hash() {
        assert_eq!(strip_replicaset_hash("web-app-5d4f8b9c7f"), "web-app");
        assert_eq!(strip_replicaset_hash("web"), "web");
        assert_eq!(strip_replicaset_hash("a-b"), "a");
    }

    // ── usage splitting ──

    #[test]
    fn test_split_usage_single_container() {
        let usage = Usage::new(200.0, 300.0);
        let out = split_usage(&usage, &[ContainerResources::default()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cpu_milli, 200.0);
    }

    #[test]
    fn test_split_usage_proportional_to_limits() {
        let usage = Usage::new(300.0, 300.0);
        let containers = vec![
            ContainerResources {
                requests: ResourceAmounts::default(),
                limits: ResourceAmounts::new(200, 100),
            },
            ContainerResources {
                requests: ResourceAmounts::default(),
                limits: ResourceAmounts::new(100, 200),
            },
        ];
        let out = split_usage(&usage, &containers);
        assert!((out[0].cpu_milli - 200.0).abs() < 0.001);
        assert!((out[1].cpu_milli - 100.0).abs() < 0.001);
        assert!((out[0].memory_mib - 100.0).abs() < 0.001);
        assert!((out[1].memory_mib - 200.0).abs() < 0.001);
    }

    #[test]
    fn test_split_usage_no_limits_splits_evenly() {
        let usage = Usage::new(300.0, 300.0);
        let containers = vec![ContainerResources::default(), ContainerResources::default()];
        let out = split_usage(&usage, &containers);
        assert!((out[0].cpu_milli - 150.0).abs() < 0.001);
        assert!((out[1].memory_mib - 150.0).abs() < 0.001);
    }

    // ── event typing ──

    #[test]
    fn test_event_type_for_directions() {
        assert_eq!(
            event_type_for(ResizeDirection::Up, false),
            EventType::ResourceOptimized
        );
        assert_eq!(
            event_type_for(ResizeDirection::Mixed, false),
            EventType::ResourceOptimized
        );
        assert_eq!(
            event_type_for(ResizeDirection::Down, false),
            EventType::ResourceUnderutilized
        );
        assert_eq!(
            event_type_for(ResizeDirection::Up, true),
            EventType::ResourceExhaustion
        );
    }

    #[test]
    fn test_usage_over_limit() {
        let current = ContainerResources {
            requests: ResourceAmounts::new(100, 128),
            limits: ResourceAmounts::new(200, 256),
        };
        assert!(usage_over_limit(&Usage::new(250.0, 100.0), &current));
        assert!(usage_over_limit(&Usage::new(100.0, 300.0), &current));
        assert!(!usage_over_limit(&Usage::new(150.0, 200.0), &current));
        assert!(!usage_over_limit(
            &Usage::new(9999.0, 9999.0),
            &ContainerResources::default()
        ));
    }

    // ── policy status counting ──

    #[test]
    fn test_matched_pod_count_respects_target_and_enabled() {
        use crate::crd::{RightSizerPolicySpec, TargetRef};

        let metas = vec![
            workload_meta_for(&pod_with_owner("ReplicaSet", "web-app-5d4f8b9c7f")),
            workload_meta_for(&pod_with_owner("StatefulSet", "db")),
        ];

        let mut policy = RightSizerPolicy {
            metadata: ObjectMeta {
                name: Some("deployments-only".to_string()),
                namespace: Some("app".to_string()),
                ..Default::default()
            },
            spec: RightSizerPolicySpec {
                target_ref: Some(TargetRef {
                    kinds: Some(vec!["Deployment".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        };

        assert_eq!(matched_pod_count(&policy, &metas), 1);

        policy.spec.target_ref = None;
        assert_eq!(matched_pod_count(&policy, &metas), 2);

        policy.spec.enabled = Some(false);
        assert_eq!(matched_pod_count(&policy, &metas), 0);
    }

    // ── remediation action mapping ──

    #[test]
    fn test_remediation_action_from_errors() {
        assert_eq!(
            remediation_action_for(&["cpu limit 50000m exceeds cap 16000m".to_string()]),
            "increase_cpu_limit"
        );
        assert_eq!(
            remediation_action_for(&["memory request 8Mi is below floor 64Mi".to_string()]),
            "increase_memory_limit"
        );
        assert_eq!(
            remediation_action_for(&["something else".to_string()]),
            "manual_review"
        );
    }

    // ── metrics registry ──

    #[test]
    fn test_metrics_register_once() {
        force_metrics();
        let names: Vec<String> = registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        for expected in [
            "rightsize_pods_processed_total",
            "rightsize_pods_resized_total",
            "rightsize_pods_skipped_total",
            "rightsize_processing_errors_total",
            "rightsize_safety_threshold_violations_total",
            "rightsize_retry_attempts_total",
            "rightsize_retry_success_total",
            "rightsize_reconcile_tick_duration_seconds",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_skip_counter_labels() {
        force_metrics();
        let before = PODS_SKIPPED.with_label_values(&["system_namespace"]).get();
        PODS_SKIPPED.with_label_values(&["system_namespace"]).inc();
        assert_eq!(
            PODS_SKIPPED.with_label_values(&["system_namespace"]).get(),
            before + 1
        );
    }
}
