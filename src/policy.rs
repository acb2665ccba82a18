use std::collections::BTreeMap;
use std::time::Duration;

use kube::ResourceExt;

use crate::config::Settings;
use crate::crd::{
    PolicyConstraints, ResourceFactors, ResourceStrategySpec, RightSizerPolicy, SelectorOperator,
    SizingMode, TargetRef,
};
use crate::resources::{QuantityError, parse_cpu, parse_memory};

/* ============================= WORKLOAD META ============================= */

/// Pod-derived metadata a policy target is matched against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadMeta {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/* ============================= EFFECTIVE STRATEGY ============================= */

/// Per-resource sizing parameters in internal units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceStrategy {
    pub request_multiplier: f64,
    pub limit_multiplier: f64,
    pub request_addition: u64,
    pub limit_addition: u64,
    pub floor: u64,
    pub cap: u64,
    pub target_utilization: f64,
}

/// The frozen merge of global defaults and the winning policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveStrategy {
    pub cpu: ResourceStrategy,
    pub memory: ResourceStrategy,
    pub max_change_ratio: f64,
    pub cooldown: Duration,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub min_change_threshold: f64,
    pub preserve_guaranteed_qos: bool,
    pub mode: SizingMode,
    /// "default" or the name of the winning policy.
    pub source: String,
}

impl EffectiveStrategy {
    /// Build the global default strategy from the effective configuration.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cpu: ResourceStrategy {
                request_multiplier: settings.cpu_request_multiplier,
                limit_multiplier: settings.cpu_limit_multiplier,
                request_addition: settings.cpu_request_addition_milli,
                limit_addition: settings.cpu_limit_addition_milli,
                floor: settings.min_cpu_request_milli,
                cap: settings.max_cpu_limit_milli,
                target_utilization: settings.scale_up_threshold,
            },
            memory: ResourceStrategy {
                request_multiplier: settings.memory_request_multiplier,
                limit_multiplier: settings.memory_limit_multiplier,
                request_addition: settings.memory_request_addition_mib,
                limit_addition: settings.memory_limit_addition_mib,
                floor: settings.min_memory_request_mib,
                cap: settings.max_memory_limit_mib,
                target_utilization: settings.scale_up_threshold,
            },
            max_change_ratio: settings.safety_threshold,
            cooldown: settings.cooldown,
            scale_up_threshold: settings.scale_up_threshold,
            scale_down_threshold: settings.scale_down_threshold,
            min_change_threshold: settings.min_change_threshold,
            preserve_guaranteed_qos: settings.preserve_guaranteed_qos,
            mode: SizingMode::Balanced,
            source: "default".to_string(),
        }
    }
}

/* ============================= TARGET MATCHING ============================= */

/// Evaluate a target against workload metadata. Empty fields match any;
/// present fields are conjunctive.
pub fn target_matches(target: &TargetRef, meta: &WorkloadMeta) -> bool {
    if let Some(kinds) = &target.kinds
        && !kinds.is_empty()
        && !kinds.iter().any(|k| k == &meta.kind)
    {
        return false;
    }

    if let Some(namespaces) = &target.namespaces
        && !namespaces.is_empty()
        && !namespaces.iter().any(|n| n == &meta.namespace)
    {
        return false;
    }

    if let Some(selector) = &target.label_selector {
        for (key, value) in selector {
            if meta.labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    if let Some(expressions) = &target.match_expressions {
        for expr in expressions {
            let label = meta.labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or(&[]);
            let matched = match expr.operator {
                SelectorOperator::In => {
                    label.is_some_and(|v| values.iter().any(|want| want == v))
                }
                // Objects without the key also satisfy NotIn, matching the
                // standard label-selector contract.
                SelectorOperator::NotIn => {
                    label.is_none_or(|v| !values.iter().any(|want| want == v))
                }
                SelectorOperator::Exists => label.is_some(),
                SelectorOperator::DoesNotExist => label.is_none(),
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

/* ============================= RESOLUTION ============================= */

/// Resolve the effective strategy for a workload.
///
/// Enabled policies whose targets match are ordered by descending priority,
/// then by name for determinism; the first wins. With no match, the global
/// default from the configuration applies.
pub fn resolve(
    policies: &[RightSizerPolicy],
    meta: &WorkloadMeta,
    settings: &Settings,
) -> Result<EffectiveStrategy, QuantityError> {
    let mut candidates: Vec<&RightSizerPolicy> = policies
        .iter()
        .filter(|p| p.spec.enabled.unwrap_or(true))
        .filter(|p| {
            p.spec
                .target_ref
                .as_ref()
                .is_none_or(|t| target_matches(t, meta))
        })
        .collect();

    candidates.sort_by(|a, b| {
        let pa = a.spec.priority.unwrap_or(0);
        let pb = b.spec.priority.unwrap_or(0);
        pb.cmp(&pa).then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let base = EffectiveStrategy::from_settings(settings);
    match candidates.first() {
        Some(policy) => merge_policy(base, policy),
        None => Ok(base),
    }
}

fn merge_policy(
    mut base: EffectiveStrategy,
    policy: &RightSizerPolicy,
) -> Result<EffectiveStrategy, QuantityError> {
    base.source = policy.name_any();
    if let Some(mode) = &policy.spec.mode {
        base.mode = mode.clone();
    }

    if let Some(strategy) = &policy.spec.resource_strategy {
        merge_strategy(&mut base, strategy)?;
    }
    if let Some(constraints) = &policy.spec.constraints {
        merge_constraints(&mut base, constraints)?;
    }
    Ok(base)
}

fn merge_strategy(
    base: &mut EffectiveStrategy,
    spec: &ResourceStrategySpec,
) -> Result<(), QuantityError> {
    if let Some(cpu) = &spec.cpu {
        merge_factors(&mut base.cpu, cpu, parse_cpu)?;
    }
    if let Some(memory) = &spec.memory {
        merge_factors(&mut base.memory, memory, parse_memory)?;
    }

    if let Some(v) = spec.max_change_ratio {
        base.max_change_ratio = v;
    }
    if let Some(v) = spec.cooldown_seconds {
        base.cooldown = Duration::from_secs(v);
    }
    if let Some(v) = spec.scale_up_threshold {
        base.scale_up_threshold = v;
    }
    if let Some(v) = spec.scale_down_threshold {
        base.scale_down_threshold = v;
    }
    if let Some(v) = spec.min_change_threshold {
        base.min_change_threshold = v;
    }
    if let Some(v) = spec.preserve_guaranteed_qos {
        base.preserve_guaranteed_qos = v;
    }
    Ok(())
}

fn merge_factors(
    base: &mut ResourceStrategy,
    spec: &ResourceFactors,
    parse: fn(&str) -> Result<u64, QuantityError>,
) -> Result<(), QuantityError> {
    if let Some(v) = spec.request_multiplier {
        base.request_multiplier = v;
    }
    if let Some(v) = spec.limit_multiplier {
        base.limit_multiplier = v;
    }
    if let Some(q) = &spec.request_addition {
        base.request_addition = parse(q)?;
    }
    if let Some(q) = &spec.limit_addition {
        base.limit_addition = parse(q)?;
    }
    if let Some(q) = &spec.floor {
        base.floor = parse(q)?;
    }
    if let Some(q) = &spec.cap {
        base.cap = parse(q)?;
    }
    if let Some(v) = spec.target_utilization {
        base.target_utilization = v;
    }
    Ok(())
}

/// Constraints tighten the strategy: floors can only rise, caps only fall.
fn merge_constraints(
    base: &mut EffectiveStrategy,
    constraints: &PolicyConstraints,
) -> Result<(), QuantityError> {
    if let Some(q) = &constraints.min_cpu_request {
        base.cpu.floor = base.cpu.floor.max(parse_cpu(q)?);
    }
    if let Some(q) = &constraints.max_cpu_limit {
        base.cpu.cap = base.cpu.cap.min(parse_cpu(q)?);
    }
    if let Some(q) = &constraints.min_memory_request {
        base.memory.floor = base.memory.floor.max(parse_memory(q)?);
    }
    if let Some(q) = &constraints.max_memory_limit {
        base.memory.cap = base.memory.cap.min(parse_memory(q)?);
    }
    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MatchExpression, RightSizerPolicySpec};
    use kube::api::ObjectMeta;

    fn meta_with_labels(pairs: &[(&str, &str)]) -> WorkloadMeta {
        WorkloadMeta {
            namespace: "app".to_string(),
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            labels: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn policy(name: &str, priority: i32, target: Option<TargetRef>) -> RightSizerPolicy {
        RightSizerPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("app".to_string()),
                ..Default::default()
            },
            spec: RightSizerPolicySpec {
                enabled: Some(true),
                priority: Some(priority),
                target_ref: target,
                ..Default::default()
            },
            status: None,
        }
    }

    // ── target matching ──

    #[test]
    fn test_empty_target_matches_everything() {
        assert!(target_matches(&TargetRef::default(), &meta_with_labels(&[])));
    }

    #[test]
    fn test_kind_matching() {
        let target = TargetRef {
            kinds: Some(vec!["Deployment".to_string()]),
            ..Default::default()
        };
        assert!(target_matches(&target, &meta_with_labels(&[])));

        let target = TargetRef {
            kinds: Some(vec!["StatefulSet".to_string()]),
            ..Default::default()
        };
        assert!(!target_matches(&target, &meta_with_labels(&[])));
    }

    #[test]
    fn test_namespace_matching() {
        let target = TargetRef {
            namespaces: Some(vec!["app".to_string(), "web".to_string()]),
            ..Default::default()
        };
        assert!(target_matches(&target, &meta_with_labels(&[])));

        let target = TargetRef {
            namespaces: Some(vec!["other".to_string()]),
            ..Default::default()
        };
        assert!(!target_matches(&target, &meta_with_labels(&[])));
    }

    #[test]
    fn test_label_selector_exact_match() {
        let target = TargetRef {
            label_selector: Some(BTreeMap::from([(
                "tier".to_string(),
                "web".to_string(),
            )])),
            ..Default::default()
        };
        assert!(target_matches(&target, &meta_with_labels(&[("tier", "web")])));
        assert!(!target_matches(&target, &meta_with_labels(&[("tier", "db")])));
        assert!(!target_matches(&target, &meta_with_labels(&[])));
    }

    fn expr(key: &str, operator: SelectorOperator, values: &[&str]) -> TargetRef {
        TargetRef {
            match_expressions: Some(vec![MatchExpression {
                key: key.to_string(),
                operator,
                values: if values.is_empty() {
                    None
                } else {
                    Some(values.iter().map(|v| v.to_string()).collect())
                },
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_expression_in() {
        let target = expr("env", SelectorOperator::In, &["prod", "staging"]);
        assert!(target_matches(&target, &meta_with_labels(&[("env", "prod")])));
        assert!(!target_matches(&target, &meta_with_labels(&[("env", "dev")])));
        assert!(!target_matches(&target, &meta_with_labels(&[])));
    }

    #[test]
    fn test_expression_not_in() {
        let target = expr("env", SelectorOperator::NotIn, &["dev"]);
        assert!(target_matches(&target, &meta_with_labels(&[("env", "prod")])));
        assert!(!target_matches(&target, &meta_with_labels(&[("env", "dev")])));
        // Missing key satisfies NotIn.
        assert!(target_matches(&target, &meta_with_labels(&[])));
    }

    #[test]
    fn test_expression_exists() {
        let target = expr("env", SelectorOperator::Exists, &[]);
        assert!(target_matches(&target, &meta_with_labels(&[("env", "anything")])));
        assert!(!target_matches(&target, &meta_with_labels(&[])));
    }

    #[test]
    fn test_expression_does_not_exist() {
        let target = expr("env", SelectorOperator::DoesNotExist, &[]);
        assert!(!target_matches(&target, &meta_with_labels(&[("env", "x")])));
        assert!(target_matches(&target, &meta_with_labels(&[])));
    }

    #[test]
    fn test_target_fields_are_conjunctive() {
        let target = TargetRef {
            kinds: Some(vec!["Deployment".to_string()]),
            namespaces: Some(vec!["other".to_string()]),
            ..Default::default()
        };
        assert!(!target_matches(&target, &meta_with_labels(&[])));
    }

    // ── resolution ──

    #[test]
    fn test_no_policies_falls_back_to_default() {
        let strategy = resolve(&[], &meta_with_labels(&[]), &Settings::default()).unwrap();
        assert_eq!(strategy.source, "default");
        assert_eq!(strategy.cpu.request_multiplier, 1.2);
    }

    #[test]
    fn test_disabled_policy_is_skipped() {
        let mut p = policy("p1", 10, None);
        p.spec.enabled = Some(false);
        let strategy = resolve(&[p], &meta_with_labels(&[]), &Settings::default()).unwrap();
        assert_eq!(strategy.source, "default");
    }

    #[test]
    fn test_highest_priority_wins() {
        let policies = vec![policy("low", 1, None), policy("high", 100, None)];
        let strategy = resolve(&policies, &meta_with_labels(&[]), &Settings::default()).unwrap();
        assert_eq!(strategy.source, "high");
    }

    #[test]
    fn test_priority_tie_broken_by_name() {
        let policies = vec![policy("zeta", 5, None), policy("alpha", 5, None)];
        let strategy = resolve(&policies, &meta_with_labels(&[]), &Settings::default()).unwrap();
        assert_eq!(strategy.source, "alpha");
    }

    #[test]
    fn test_non_matching_policy_is_skipped() {
        let target = TargetRef {
            namespaces: Some(vec!["other".to_string()]),
            ..Default::default()
        };
        let policies = vec![policy("scoped", 100, Some(target)), policy("any", 1, None)];
        let strategy = resolve(&policies, &meta_with_labels(&[]), &Settings::default()).unwrap();
        assert_eq!(strategy.source, "any");
    }

    // ── merging ──

    #[test]
    fn test_policy_strategy_overrides_defaults() {
        let mut p = policy("tuned", 10, None);
        p.spec.mode = Some(SizingMode::Aggressive);
        p.spec.resource_strategy = Some(ResourceStrategySpec {
            cpu: Some(ResourceFactors {
                request_multiplier: Some(1.5),
                floor: Some("50m".to_string()),
                cap: Some("4".to_string()),
                ..Default::default()
            }),
            max_change_ratio: Some(0.25),
            scale_up_threshold: Some(0.9),
            ..Default::default()
        });

        let settings = Settings::default();
        let strategy = resolve(&[p], &meta_with_labels(&[]), &settings).unwrap();

        assert_eq!(strategy.source, "tuned");
        assert_eq!(strategy.mode, SizingMode::Aggressive);
        assert_eq!(strategy.cpu.request_multiplier, 1.5);
        assert_eq!(strategy.cpu.floor, 50);
        assert_eq!(strategy.cpu.cap, 4000);
        assert_eq!(strategy.max_change_ratio, 0.25);
        assert_eq!(strategy.scale_up_threshold, 0.9);
        // Untouched fields keep the defaults.
        assert_eq!(strategy.cpu.limit_multiplier, settings.cpu_limit_multiplier);
        assert_eq!(strategy.memory.request_multiplier, 1.2);
    }

    #[test]
    fn test_constraints_only_tighten() {
        let mut p = policy("bounded", 10, None);
        p.spec.constraints = Some(PolicyConstraints {
            // Looser than the default floor of 10m: must not lower it.
            min_cpu_request: Some("5m".to_string()),
            // Tighter than the default cap of 16 cores: must apply.
            max_cpu_limit: Some("2".to_string()),
            min_memory_request: Some("128Mi".to_string()),
            max_memory_limit: Some("64Gi".to_string()),
            ..Default::default()
        });

        let strategy = resolve(&[p], &meta_with_labels(&[]), &Settings::default()).unwrap();
        assert_eq!(strategy.cpu.floor, 10);
        assert_eq!(strategy.cpu.cap, 2000);
        assert_eq!(strategy.memory.floor, 128);
        assert_eq!(strategy.memory.cap, 32_768);
    }

    #[test]
    fn test_bad_policy_quantity_is_an_error() {
        let mut p = policy("broken", 10, None);
        p.spec.resource_strategy = Some(ResourceStrategySpec {
            cpu: Some(ResourceFactors {
                cap: Some("a-lot".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(resolve(&[p], &meta_with_labels(&[]), &Settings::default()).is_err());
    }

    #[test]
    fn test_default_strategy_from_settings() {
        let mut settings = Settings::default();
        settings.preserve_guaranteed_qos = false;
        settings.min_memory_request_mib = 32;

        let strategy = EffectiveStrategy::from_settings(&settings);
        assert!(!strategy.preserve_guaranteed_qos);
        assert_eq!(strategy.memory.floor, 32);
        assert_eq!(strategy.cooldown, settings.cooldown);
        assert_eq!(strategy.mode, SizingMode::Balanced);
    }
}
