use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::recommend::Proposal;
use crate::resources::{parse_cpu_usage, parse_memory_usage, ContainerResources};

const FIELD_MANAGER: &str = "kube-rightsize";
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/* ============================= OUTCOMES ============================= */

/// Terminal result of a resize attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The pod status reflects the desired resources.
    Applied,
    /// The resize was accepted and is still in progress at the deadline.
    Pending,
    /// The cluster rejected the resize as impossible on this node.
    Infeasible(String),
    /// The cluster lacks the resize subresource; nothing was mutated.
    Unsupported,
}

/// Errors the caller may retry or surface.
#[derive(Debug, thiserror::Error)]
pub enum ResizeError {
    #[error("pod not found: {0}")]
    NotFound(String),

    #[error("not authorized to resize: {0}")]
    Unauthorized(String),

    #[error("conflicting update while patching: {0}")]
    Conflict(String),

    #[error("resize timed out: {0}")]
    Timeout(String),

    #[error("resize failed: {0}")]
    Other(String),
}

impl ResizeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResizeError::Conflict(_) | ResizeError::Timeout(_) | ResizeError::Other(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResizeError::NotFound(_) => "not_found",
            ResizeError::Unauthorized(_) => "unauthorized",
            ResizeError::Conflict(_) => "conflict",
            ResizeError::Timeout(_) => "timeout",
            ResizeError::Other(_) => "other",
        }
    }
}

fn classify_kube_error(e: kube::Error) -> ResizeError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => ResizeError::NotFound(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            ResizeError::Unauthorized(ae.message.clone())
        }
        kube::Error::Api(ae) if ae.code == 409 => ResizeError::Conflict(ae.message.clone()),
        _ => ResizeError::Other(e.to_string()),
    }
}

/* ============================= PATCH ============================= */

/// Strategic merge patch for the resize subresource. Only the container
/// name and the new resources block are sent; the pod is never replaced.
pub fn build_resize_patch(container: &str, desired: &ContainerResources) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "containers": [{
                "name": container,
                "resources": desired.to_k8s(),
            }]
        }
    })
}

/* ============================= STATUS INTERPRETATION ============================= */

#[derive(Debug, Clone, PartialEq, Eq)]
enum PollDecision {
    Applied,
    InProgress,
    Infeasible(String),
    Waiting,
}

/// Read the pod's resize state for one container.
fn poll_decision(pod: &Pod, container: &str, desired: &ContainerResources) -> PollDecision {
    if let Some(status) = &pod.status {
        if let Some(conditions) = &status.conditions {
            for condition in conditions {
                if condition.type_ == "PodResizePending" && condition.status == "True" {
                    if condition.reason.as_deref() == Some("Infeasible") {
                        return PollDecision::Infeasible(
                            condition
                                .message
                                .clone()
                                .unwrap_or_else(|| "resize infeasible".to_string()),
                        );
                    }
                    return PollDecision::Waiting;
                }
                if condition.type_ == "PodResizeInProgress" && condition.status == "True" {
                    return PollDecision::InProgress;
                }
            }
        }

        if let Some(statuses) = &status.container_statuses
            && let Some(cs) = statuses.iter().find(|cs| cs.name == container)
            && let Some(actual) = &cs.resources
            && status_matches_desired(actual, desired)
        {
            return PollDecision::Applied;
        }
    }
    PollDecision::Waiting
}

/// Compare the allocated resources reported in status with the desired
/// ones, tolerating quantity formatting differences.
fn status_matches_desired(
    actual: &k8s_openapi::api::core::v1::ResourceRequirements,
    desired: &ContainerResources,
) -> bool {
    let read = |map: &Option<std::collections::BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>,
                key: &str,
                parse: fn(&str) -> f64|
     -> Option<u64> { map.as_ref()?.get(key).map(|q| parse(&q.0).round() as u64) };

    let pairs = [
        (read(&actual.requests, "cpu", parse_cpu_usage), desired.requests.cpu_milli),
        (read(&actual.limits, "cpu", parse_cpu_usage), desired.limits.cpu_milli),
        (read(&actual.requests, "memory", parse_memory_usage), desired.requests.memory_mib),
        (read(&actual.limits, "memory", parse_memory_usage), desired.limits.memory_mib),
    ];
    pairs
        .iter()
        .all(|(actual, desired)| desired.is_none() || actual == desired)
}

/* ============================= SUPPORT DETECTION ============================= */

const SUPPORT_UNKNOWN: u8 = 0;
const SUPPORT_YES: u8 = 1;
const SUPPORT_NO: u8 = 2;

/* ============================= EXECUTOR ============================= */

/// Issues in-place resizes through the pod resize subresource and
/// interprets the resulting status conditions.
pub struct ResizeExecutor {
    client: Client,
    support: AtomicU8,
    enabled: AtomicBool,
}

impl ResizeExecutor {
    pub fn new(client: Client, enabled: bool) -> Self {
        Self {
            client,
            support: AtomicU8::new(SUPPORT_UNKNOWN),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Whether in-place resizes may be attempted right now.
    pub async fn can_resize(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.detect_support().await
    }

    /// Feature detection against the apiserver version, cached for the
    /// process lifetime. The resize subresource shipped in 1.33.
    pub async fn detect_support(&self) -> bool {
        match self.support.load(Ordering::SeqCst) {
            SUPPORT_YES => return true,
            SUPPORT_NO => return false,
            _ => {}
        }

        let supported = match self.client.apiserver_version().await {
            Ok(version) => {
                let minor: u32 = version
                    .minor
                    .trim_end_matches('+')
                    .parse()
                    .unwrap_or_default();
                let major: u32 = version.major.parse().unwrap_or_default();
                major > 1 || (major == 1 && minor >= 33)
            }
            Err(e) => {
                warn!(error = %e, "resize_support_detection_failed");
                return false; // Not cached; try again next time.
            }
        };

        self.support.store(
            if supported { SUPPORT_YES } else { SUPPORT_NO },
            Ordering::SeqCst,
        );
        if !supported {
            info!("cluster_lacks_resize_subresource_downgrading_to_proposals");
        }
        supported
    }

    /// Downgrade to proposal-only mode for the rest of the process.
    pub fn mark_unsupported(&self) {
        self.support.store(SUPPORT_NO, Ordering::SeqCst);
    }

    /// Apply one container proposal in place.
    ///
    /// Never mutates when the feature is off or the cluster lacks the
    /// subresource; a no-op desired state short-circuits to `Applied`.
    pub async fn apply(
        &self,
        pod: &Pod,
        proposal: &Proposal,
        safety_timeout: Duration,
    ) -> Result<ResizeOutcome, ResizeError> {
        if !self.can_resize().await {
            return Ok(ResizeOutcome::Unsupported);
        }

        if proposal.desired == proposal.current {
            debug!(pod = %pod.name_any(), "resize_noop_skipped");
            return Ok(ResizeOutcome::Applied);
        }

        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let generation_before = pod.metadata.generation;
        let patch = build_resize_patch(&proposal.container, &proposal.desired);

        pods.patch_subresource(
            "resize",
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Strategic(&patch),
        )
        .await
        .map_err(classify_kube_error)?;

        info!(
            pod = %name,
            namespace = %namespace,
            container = %proposal.container,
            "resize_patch_submitted"
        );

        let outcome = self
            .wait_for_resize(&pods, &name, proposal, safety_timeout)
            .await?;

        if outcome == ResizeOutcome::Applied {
            let fresh = pods.get(&name).await.map_err(classify_kube_error)?;
            match (generation_before, fresh.metadata.generation) {
                (Some(before), Some(after)) if after > before => {}
                (before, after) => warn!(
                    pod = %name,
                    ?before,
                    ?after,
                    "resize_applied_without_generation_bump"
                ),
            }
        }

        Ok(outcome)
    }

    async fn wait_for_resize(
        &self,
        pods: &Api<Pod>,
        name: &str,
        proposal: &Proposal,
        safety_timeout: Duration,
    ) -> Result<ResizeOutcome, ResizeError> {
        let deadline = tokio::time::Instant::now() + safety_timeout;
        let mut saw_in_progress = false;

        loop {
            let pod = pods.get(name).await.map_err(classify_kube_error)?;
            match poll_decision(&pod, &proposal.container, &proposal.desired) {
                PollDecision::Applied => return Ok(ResizeOutcome::Applied),
                PollDecision::Infeasible(reason) => {
                    return Ok(ResizeOutcome::Infeasible(reason));
                }
                PollDecision::InProgress => saw_in_progress = true,
                PollDecision::Waiting => {}
            }

            if tokio::time::Instant::now() >= deadline {
                // The resize keeps progressing server-side; report pending
                // rather than failing the decision.
                debug!(pod = %name, saw_in_progress, "resize_poll_deadline_reached");
                return Ok(ResizeOutcome::Pending);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommend::ResizeDirection;
    use crate::resources::ResourceAmounts;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn desired() -> ContainerResources {
        ContainerResources {
            requests: ResourceAmounts::new(216, 128),
            limits: ResourceAmounts::new(432, 256),
        }
    }

    fn k8s_requirements(
        req: &[(&str, &str)],
        lim: &[(&str, &str)],
    ) -> k8s_openapi::api::core::v1::ResourceRequirements {
        let build = |pairs: &[(&str, &str)]| -> Option<BTreeMap<String, Quantity>> {
            if pairs.is_empty() {
                return None;
            }
            Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                    .collect(),
            )
        };
        k8s_openapi::api::core::v1::ResourceRequirements {
            requests: build(req),
            limits: build(lim),
            ..Default::default()
        }
    }

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            metadata: Default::default(),
            spec: None,
            status: Some(status),
        }
    }

    // ── patch shape ──

    #[test]
    fn test_patch_contains_only_name_and_resources() {
        let patch = build_resize_patch("w", &desired());
        let containers = &patch["spec"]["containers"];
        assert_eq!(containers.as_array().unwrap().len(), 1);
        assert_eq!(containers[0]["name"], "w");
        assert_eq!(containers[0]["resources"]["requests"]["cpu"], "216m");
        assert_eq!(containers[0]["resources"]["limits"]["memory"], "256Mi");
        // Nothing else leaks into the patch.
        assert!(patch["metadata"].is_null());
        assert!(containers[0]["image"].is_null());
    }

    // ── status interpretation ──

    #[test]
    fn test_poll_applied_when_status_matches() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "w".to_string(),
                resources: Some(k8s_requirements(
                    &[("cpu", "216m"), ("memory", "128Mi")],
                    &[("cpu", "432m"), ("memory", "256Mi")],
                )),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(poll_decision(&pod, "w", &desired()), PollDecision::Applied);
    }

    #[test]
    fn test_poll_waiting_when_status_stale() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "w".to_string(),
                resources: Some(k8s_requirements(
                    &[("cpu", "100m"), ("memory", "128Mi")],
                    &[("cpu", "200m"), ("memory", "256Mi")],
                )),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(poll_decision(&pod, "w", &desired()), PollDecision::Waiting);
    }

    #[test]
    fn test_poll_in_progress_condition() {
        let pod = pod_with_status(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodResizeInProgress".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            poll_decision(&pod, "w", &desired()),
            PollDecision::InProgress
        );
    }

    #[test]
    fn test_poll_infeasible_condition() {
        let pod = pod_with_status(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodResizePending".to_string(),
                status: "True".to_string(),
                reason: Some("Infeasible".to_string()),
                message: Some("node lacks 50 cores".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            poll_decision(&pod, "w", &desired()),
            PollDecision::Infeasible("node lacks 50 cores".to_string())
        );
    }

    #[test]
    fn test_poll_pending_deferred_is_waiting() {
        let pod = pod_with_status(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodResizePending".to_string(),
                status: "True".to_string(),
                reason: Some("Deferred".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(poll_decision(&pod, "w", &desired()), PollDecision::Waiting);
    }

    #[test]
    fn test_poll_no_status_is_waiting() {
        let pod = Pod::default();
        assert_eq!(poll_decision(&pod, "w", &desired()), PollDecision::Waiting);
    }

    #[test]
    fn test_status_match_tolerates_quantity_formats() {
        // Status echoing cores instead of millicores still matches.
        let actual = k8s_requirements(
            &[("cpu", "216m"), ("memory", "134217728")],
            &[("cpu", "432m"), ("memory", "256Mi")],
        );
        assert!(status_matches_desired(&actual, &desired()));
    }

    #[test]
    fn test_status_match_ignores_unset_desired_fields() {
        let partial = ContainerResources {
            requests: ResourceAmounts {
                cpu_milli: Some(216),
                memory_mib: None,
            },
            limits: ResourceAmounts::default(),
        };
        let actual = k8s_requirements(&[("cpu", "216m"), ("memory", "999Mi")], &[]);
        assert!(status_matches_desired(&actual, &partial));
    }

    // ── error classes ──

    #[test]
    fn test_error_kinds_and_transience() {
        assert!(ResizeError::Conflict("x".into()).is_transient());
        assert!(ResizeError::Timeout("x".into()).is_transient());
        assert!(!ResizeError::NotFound("x".into()).is_transient());
        assert!(!ResizeError::Unauthorized("x".into()).is_transient());
        assert_eq!(ResizeError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(ResizeError::NotFound("x".into()).kind(), "not_found");
    }

    // ── no-op and direction plumbing ──

    #[test]
    fn test_noop_proposal_equality() {
        let current = desired();
        let proposal = Proposal {
            container: "w".to_string(),
            current,
            desired: current,
            direction: ResizeDirection::Up,
            reason: "noop".to_string(),
        };
        assert_eq!(proposal.desired, proposal.current);
    }
}
