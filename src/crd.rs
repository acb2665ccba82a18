use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SHARED TYPES ============================= */

/// Sizing mode selecting how aggressively recommendations track usage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SizingMode {
    Adaptive,
    #[default]
    Balanced,
    Aggressive,
    Conservative,
    Custom,
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConfigSource {
    #[default]
    Default,
    Crd,
}

/// Metrics backend selector.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MetricsProviderKind {
    #[default]
    MetricsServer,
    Prometheus,
}

/* ============================= POLICY TARGETING ============================= */

/// Label-selector expression operator, following the standard contract.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One label-selector requirement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchExpression {
    pub key: String,
    pub operator: SelectorOperator,

    /// Required for `In`/`NotIn`; ignored for `Exists`/`DoesNotExist`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

/// Selects which workloads a policy applies to. All present fields must
/// match (conjunctive); an empty target matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Workload kinds (e.g. Deployment, StatefulSet). Empty = any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<String>>,

    /// Namespaces the policy applies to. Empty = any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Vec<String>>,

    /// Exact-match label selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<BTreeMap<String, String>>,

    /// Expression-based label selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Vec<MatchExpression>>,
}

/* ============================= STRATEGY ============================= */

/// Per-resource sizing factors. Quantities use the strict subset:
/// CPU as `"<n>m"` or whole cores, memory as `"<n>Mi"`/`"<n>Gi"`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFactors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_multiplier: Option<f64>,

    /// Flat addition applied to the computed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_addition: Option<String>,

    /// Flat addition applied to the computed limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_addition: Option<String>,

    /// Lowest request the strategy may produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,

    /// Highest limit the strategy may produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<String>,

    /// Target utilization of the request (0..1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_utilization: Option<f64>,
}

/// Sizing strategy carried by a policy, overriding the global defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStrategySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceFactors>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceFactors>,

    /// Maximum per-decision change ratio `|new-current|/current`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_change_ratio: Option<f64>,

    /// Minimum seconds since the last resize before scaling down again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,

    /// Usage/limit ratio at or above which the strategy scales up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<f64>,

    /// Usage/limit ratio at or below which the strategy scales down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_threshold: Option<f64>,

    /// Relative change below which a proposal is dropped as noise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_change_threshold: Option<f64>,

    /// Keep Guaranteed pods Guaranteed (requests == limits).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_guaranteed_qos: Option<bool>,
}

/// Hard bounds a policy may impose on top of its strategy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_limit: Option<String>,
}

/* ============================= POLICY CRD ============================= */

/// RightSizerPolicy targets a subset of workloads with a sizing strategy.
///
/// The highest-priority enabled policy whose target matches a pod wins;
/// pods with no matching policy fall back to the global configuration.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "rightsizer.io",
    version = "v1",
    kind = "RightSizerPolicy",
    plural = "rightsizerpolicies",
    status = "RightSizerPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerPolicySpec {
    /// Disabled policies are skipped during resolution. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Higher priority wins; ties broken by name for determinism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SizingMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_strategy: Option<ResourceStrategySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<PolicyConstraints>,
}

/// Observed state of a RightSizerPolicy, updated each evaluation cycle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Pods matched by this policy in the last reconcile tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pods: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/* ============================= CONFIG CRD ============================= */

/// RightSizerConfig is the cluster-wide configuration source.
///
/// Every field is optional: an external config controller delivers partial
/// specs and the operator merges them over built-in defaults
/// (zero-valued scalars and empty lists are treated as "unchanged").
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "rightsizer.io",
    version = "v1",
    kind = "RightSizerConfig",
    plural = "rightsizerconfigs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerConfigSpec {
    // ── sizing factors ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request_multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request_multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit_multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request_addition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request_addition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit_addition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_addition: Option<String>,

    // ── floors and caps ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpu_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_limit: Option<String>,

    // ── reconcile loop ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_interval_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,

    /// Maximum allowed change ratio per decision (0..1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_threshold: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qps: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_reconciles: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_between_batches_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_between_pods_millis: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_timeout_seconds: Option<u64>,

    // ── namespace filtering ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_include: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_exclude: Option<Vec<String>>,

    // ── metrics ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_provider: Option<MetricsProviderKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_cache_ttl_seconds: Option<u64>,

    // ── thresholds ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_threshold: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_change_threshold: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,

    // ── QoS / feature flags ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_guaranteed_qos: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_in_place_resize: Option<bool>,

    // ── predictive monitor ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_seconds: Option<u64>,

    /// Minimum prediction confidence (0..1) before alerting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<f64>,

    // ── recommendations ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_recommendations: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_interval_seconds: Option<u64>,

    // ── observability ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,

    // ── leader election ──
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election_lease_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election_renew_seconds: Option<u64>,
}

/* ============================= TESTS ============================= */
