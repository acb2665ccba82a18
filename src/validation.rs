use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{LimitRange, Node, Pod};
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use crate::config::Settings;
use crate::policy::EffectiveStrategy;
use crate::recommend::Proposal;
use crate::resources::{parse_cpu_usage, parse_memory_usage, qos_class, ContainerResources};

/* ============================= REPORT ============================= */

/// Structured validation outcome. All checks run; every failure is
/// collected rather than only the first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/* ============================= CONTEXT ============================= */

/// Namespace LimitRange bounds for type `Container`, in internal units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitRangeBounds {
    pub min_cpu_milli: Option<u64>,
    pub max_cpu_milli: Option<u64>,
    pub min_memory_mib: Option<u64>,
    pub max_memory_mib: Option<u64>,
}

/// Allocatable headroom left on the target pod's node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeHeadroom {
    pub cpu_milli: i64,
    pub memory_mib: i64,
}

/// Per-container resize policy facts the feasibility check needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResizePolicyInfo {
    /// Resources whose resize policy requires a container restart.
    pub restart_required: Vec<String>,
}

/// Cluster facts gathered before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationContext {
    pub limit_range: Option<LimitRangeBounds>,
    pub node_headroom: Option<NodeHeadroom>,
    pub resize_supported: bool,
    pub resize_policy: ResizePolicyInfo,
}

/* ============================= VALIDATION ============================= */

/// Validate one container proposal against invariants, configuration, and
/// cluster facts. `before`/`after` carry every container of the pod so the
/// QoS transition can be predicted.
pub fn validate(
    proposal: &Proposal,
    before: &[ContainerResources],
    after: &[ContainerResources],
    strategy: &EffectiveStrategy,
    settings: &Settings,
    context: &ValidationContext,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_shape(proposal, &mut report);
    check_safety_gate(proposal, settings, &mut report);
    check_strategy_bounds(proposal, strategy, &mut report);
    check_limit_range(proposal, context.limit_range.as_ref(), &mut report);
    check_node_capacity(proposal, context.node_headroom, &mut report);
    check_qos(before, after, settings, &mut report);
    check_feasibility(proposal, settings, context, &mut report);

    report
}

/// Limits must cover requests for every resource present.
fn check_shape(proposal: &Proposal, report: &mut ValidationReport) {
    let d = &proposal.desired;
    if let (Some(req), Some(lim)) = (d.requests.cpu_milli, d.limits.cpu_milli)
        && lim < req
    {
        report.error(format!("cpu limit {lim}m is below request {req}m"));
    }
    if let (Some(req), Some(lim)) = (d.requests.memory_mib, d.limits.memory_mib)
        && lim < req
    {
        report.error(format!("memory limit {lim}Mi is below request {req}Mi"));
    }
}

/// The global safety gate bounds how fast resources may shrink. Growth is
/// bounded by caps and node capacity instead, so a workload under pressure
/// can always be rescued in one step.
fn check_safety_gate(proposal: &Proposal, settings: &Settings, report: &mut ValidationReport) {
    let pairs = [
        ("cpu request", proposal.current.requests.cpu_milli, proposal.desired.requests.cpu_milli, "m"),
        ("cpu limit", proposal.current.limits.cpu_milli, proposal.desired.limits.cpu_milli, "m"),
        ("memory request", proposal.current.requests.memory_mib, proposal.desired.requests.memory_mib, "Mi"),
        ("memory limit", proposal.current.limits.memory_mib, proposal.desired.limits.memory_mib, "Mi"),
    ];
    for (label, current, desired, unit) in pairs {
        if let (Some(current), Some(desired)) = (current, desired)
            && desired < current
            && !settings.is_change_within_safety(current, desired)
        {
            report.error(format!(
                "{label} shrink {current}{unit} -> {desired}{unit} exceeds safety threshold {}",
                settings.safety_threshold
            ));
        }
    }
}

fn check_strategy_bounds(
    proposal: &Proposal,
    strategy: &EffectiveStrategy,
    report: &mut ValidationReport,
) {
    let d = &proposal.desired;
    if let Some(req) = d.requests.cpu_milli
        && req < strategy.cpu.floor
    {
        report.error(format!(
            "cpu request {req}m is below floor {}m",
            strategy.cpu.floor
        ));
    }
    if let Some(lim) = d.limits.cpu_milli
        && lim > strategy.cpu.cap
    {
        report.error(format!("cpu limit {lim}m exceeds cap {}m", strategy.cpu.cap));
    }
    if let Some(req) = d.requests.memory_mib
        && req < strategy.memory.floor
    {
        report.error(format!(
            "memory request {req}Mi is below floor {}Mi",
            strategy.memory.floor
        ));
    }
    if let Some(lim) = d.limits.memory_mib
        && lim > strategy.memory.cap
    {
        report.error(format!(
            "memory limit {lim}Mi exceeds cap {}Mi",
            strategy.memory.cap
        ));
    }
}

fn check_limit_range(
    proposal: &Proposal,
    bounds: Option<&LimitRangeBounds>,
    report: &mut ValidationReport,
) {
    let Some(bounds) = bounds else { return };
    let d = &proposal.desired;

    if let (Some(req), Some(min)) = (d.requests.cpu_milli, bounds.min_cpu_milli)
        && req < min
    {
        report.error(format!("cpu request {req}m is below LimitRange minimum {min}m"));
    }
    if let (Some(lim), Some(max)) = (d.limits.cpu_milli, bounds.max_cpu_milli)
        && lim > max
    {
        report.error(format!("cpu limit {lim}m exceeds LimitRange maximum {max}m"));
    }
    if let (Some(req), Some(min)) = (d.requests.memory_mib, bounds.min_memory_mib)
        && req < min
    {
        report.error(format!(
            "memory request {req}Mi is below LimitRange minimum {min}Mi"
        ));
    }
    if let (Some(lim), Some(max)) = (d.limits.memory_mib, bounds.max_memory_mib)
        && lim > max
    {
        report.error(format!(
            "memory limit {lim}Mi exceeds LimitRange maximum {max}Mi"
        ));
    }
}

/// The node must have allocatable headroom for the request delta.
fn check_node_capacity(
    proposal: &Proposal,
    headroom: Option<NodeHeadroom>,
    report: &mut ValidationReport,
) {
    let Some(headroom) = headroom else { return };

    let delta_cpu = proposal.desired.requests.cpu_milli.unwrap_or(0) as i64
        - proposal.current.requests.cpu_milli.unwrap_or(0) as i64;
    let delta_memory = proposal.desired.requests.memory_mib.unwrap_or(0) as i64
        - proposal.current.requests.memory_mib.unwrap_or(0) as i64;

    if delta_cpu > headroom.cpu_milli {
        report.error(format!(
            "node lacks cpu headroom: need {delta_cpu}m, have {}m",
            headroom.cpu_milli
        ));
    }
    if delta_memory > headroom.memory_mib {
        report.error(format!(
            "node lacks memory headroom: need {delta_memory}Mi, have {}Mi",
            headroom.memory_mib
        ));
    }
}

fn check_qos(
    before: &[ContainerResources],
    after: &[ContainerResources],
    settings: &Settings,
    report: &mut ValidationReport,
) {
    let current = qos_class(before);
    let predicted = qos_class(after);
    if predicted != current {
        if settings.preserve_guaranteed_qos {
            report.error(format!(
                "resize would change QoS class {} -> {}",
                current.as_str(),
                predicted.as_str()
            ));
        } else {
            report.warn(format!(
                "resize changes QoS class {} -> {}",
                current.as_str(),
                predicted.as_str()
            ));
        }
    }
}

fn check_feasibility(
    proposal: &Proposal,
    settings: &Settings,
    context: &ValidationContext,
    report: &mut ValidationReport,
) {
    if !settings.enable_in_place_resize {
        return;
    }
    if !context.resize_supported {
        report.error("cluster does not support the pod resize subresource".to_string());
        return;
    }

    let mut changed = Vec::new();
    if proposal.desired.requests.cpu_milli != proposal.current.requests.cpu_milli
        || proposal.desired.limits.cpu_milli != proposal.current.limits.cpu_milli
    {
        changed.push("cpu");
    }
    if proposal.desired.requests.memory_mib != proposal.current.requests.memory_mib
        || proposal.desired.limits.memory_mib != proposal.current.limits.memory_mib
    {
        changed.push("memory");
    }

    for resource in changed {
        if context
            .resize_policy
            .restart_required
            .iter()
            .any(|r| r == resource)
        {
            report.warn(format!(
                "{resource} resize policy requires a container restart"
            ));
        }
    }
}

/// Derive resize policy facts for one container of a pod.
pub fn resize_policy_info(pod: &Pod, container: &str) -> ResizePolicyInfo {
    let mut info = ResizePolicyInfo::default();
    let Some(spec) = &pod.spec else { return info };
    let Some(c) = spec.containers.iter().find(|c| c.name == container) else {
        return info;
    };
    if let Some(policies) = &c.resize_policy {
        for policy in policies {
            if policy.restart_policy == "RestartContainer" {
                info.restart_required.push(policy.resource_name.clone());
            }
        }
    }
    info
}

/* ============================= INSPECTOR ============================= */

const LIMIT_RANGE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Fetches and caches the cluster facts validation needs.
pub struct ClusterInspector {
    client: Client,
    limit_ranges: Mutex<HashMap<String, (Option<LimitRangeBounds>, Instant)>>,
}

impl ClusterInspector {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            limit_ranges: Mutex::new(HashMap::new()),
        }
    }

    /// Merged container bounds of the namespace's LimitRanges, cached.
    pub async fn limit_range_for(
        &self,
        namespace: &str,
    ) -> Result<Option<LimitRangeBounds>, kube::Error> {
        {
            let cache = self.limit_ranges.lock().expect("inspector lock poisoned");
            if let Some((bounds, stored_at)) = cache.get(namespace)
                && stored_at.elapsed() < LIMIT_RANGE_CACHE_TTL
            {
                return Ok(*bounds);
            }
        }

        let api: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        let bounds = merge_limit_ranges(&list.items);

        self.limit_ranges
            .lock()
            .expect("inspector lock poisoned")
            .insert(namespace.to_string(), (bounds, Instant::now()));
        debug!(namespace, "limit_range_cached");
        Ok(bounds)
    }

    /// Allocatable headroom on a node: allocatable minus the sum of pod
    /// requests currently scheduled there.
    pub async fn node_headroom(&self, node: &str) -> Result<Option<NodeHeadroom>, kube::Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_obj = nodes.get(node).await?;
        let Some(allocatable) = node_obj.status.as_ref().and_then(|s| s.allocatable.as_ref())
        else {
            return Ok(None);
        };

        let alloc_cpu = allocatable
            .get("cpu")
            .map(|q| parse_cpu_usage(&q.0))
            .unwrap_or(0.0);
        let alloc_memory = allocatable
            .get("memory")
            .map(|q| parse_memory_usage(&q.0))
            .unwrap_or(0.0);

        let pods: Api<Pod> = Api::all(self.client.clone());
        let on_node = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await?;

        let mut requested_cpu = 0.0;
        let mut requested_memory = 0.0;
        for pod in &on_node.items {
            let Some(spec) = &pod.spec else { continue };
            for container in &spec.containers {
                let Some(resources) = &container.resources else {
                    continue;
                };
                if let Some(requests) = &resources.requests {
                    if let Some(q) = requests.get("cpu") {
                        requested_cpu += parse_cpu_usage(&q.0);
                    }
                    if let Some(q) = requests.get("memory") {
                        requested_memory += parse_memory_usage(&q.0);
                    }
                }
            }
        }

        Ok(Some(NodeHeadroom {
            cpu_milli: (alloc_cpu - requested_cpu) as i64,
            memory_mib: (alloc_memory - requested_memory) as i64,
        }))
    }

    pub fn invalidate_limit_ranges(&self) {
        self.limit_ranges
            .lock()
            .expect("inspector lock poisoned")
            .clear();
    }
}

/// Fold every `type: Container` entry into a single bound set, keeping the
/// tightest min and max.
fn merge_limit_ranges(items: &[LimitRange]) -> Option<LimitRangeBounds> {
    let mut bounds = LimitRangeBounds::default();
    let mut found = false;

    for lr in items {
        let Some(spec) = &lr.spec else { continue };
        for item in &spec.limits {
            if item.type_ != "Container" {
                continue;
            }
            found = true;
            if let Some(min) = &item.min {
                if let Some(q) = min.get("cpu") {
                    let v = parse_cpu_usage(&q.0) as u64;
                    bounds.min_cpu_milli = Some(bounds.min_cpu_milli.map_or(v, |b| b.max(v)));
                }
                if let Some(q) = min.get("memory") {
                    let v = parse_memory_usage(&q.0) as u64;
                    bounds.min_memory_mib = Some(bounds.min_memory_mib.map_or(v, |b| b.max(v)));
                }
            }
            if let Some(max) = &item.max {
                if let Some(q) = max.get("cpu") {
                    let v = parse_cpu_usage(&q.0) as u64;
                    bounds.max_cpu_milli = Some(bounds.max_cpu_milli.map_or(v, |b| b.min(v)));
                }
                if let Some(q) = max.get("memory") {
                    let v = parse_memory_usage(&q.0) as u64;
                    bounds.max_memory_mib = Some(bounds.max_memory_mib.map_or(v, |b| b.min(v)));
                }
            }
        }
    }

    found.then_some(bounds)
}

/* ============================= TESTS ============================= */
