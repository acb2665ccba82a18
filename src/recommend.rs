use chrono::{DateTime, Utc};

use crate::metrics::Usage;
use crate::policy::{EffectiveStrategy, ResourceStrategy};
use crate::resources::{ContainerResources, QosClass, ResourceAmounts};

/* ============================= TYPES ============================= */

/// Direction of a proposed resize, used for event detail and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDirection {
    Up,
    Down,
    Mixed,
}

impl ResizeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResizeDirection::Up => "up",
            ResizeDirection::Down => "down",
            ResizeDirection::Mixed => "mixed",
        }
    }
}

/// A concrete sizing proposal for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub container: String,
    pub current: ContainerResources,
    pub desired: ContainerResources,
    pub direction: ResizeDirection,
    pub reason: String,
}

/// Why no proposal was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Usage sits between the scale thresholds.
    WithinThresholds,
    /// The change was smaller than the minimum change threshold.
    BelowMinChange,
    /// Scale-down wanted but the cooldown has not elapsed.
    Cooldown,
    /// A resize would demote the pod out of the Guaranteed class.
    WouldChangeQos,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::WithinThresholds => "within_thresholds",
            SkipReason::BelowMinChange => "below_min_change",
            SkipReason::Cooldown => "cooldown",
            SkipReason::WouldChangeQos => "would_change_qos",
        }
    }
}

/// The outcome of evaluating one container.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingOutcome {
    Resize(Proposal),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Up,
    Down,
    Hold,
}

/* ============================= ENGINE ============================= */

/// Compute a sizing recommendation for a single container.
///
/// `last_resized` is the time of the last successful resize for this
/// container; scale-down additionally requires the cooldown to have
/// elapsed since then.
pub fn recommend(
    container: &str,
    usage: &Usage,
    current: &ContainerResources,
    strategy: &EffectiveStrategy,
    pod_qos: QosClass,
    last_resized: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SizingOutcome {
    if pod_qos == QosClass::Guaranteed && !strategy.preserve_guaranteed_qos {
        // Independent requests and limits would demote the pod.
        return SizingOutcome::Skip(SkipReason::WouldChangeQos);
    }

    let cooldown_elapsed = match last_resized {
        None => true,
        Some(t) => now.signed_duration_since(t).to_std().unwrap_or_default() >= strategy.cooldown,
    };

    let cpu_trigger = trigger(
        usage.cpu_milli,
        current.limits.cpu_milli,
        strategy.scale_up_threshold,
        strategy.scale_down_threshold,
    );
    let memory_trigger = trigger(
        usage.memory_mib,
        current.limits.memory_mib,
        strategy.scale_up_threshold,
        strategy.scale_down_threshold,
    );

    let mut cooldown_blocked = false;
    let mut effective_cpu = cpu_trigger;
    let mut effective_memory = memory_trigger;
    if cpu_trigger == Trigger::Down && !cooldown_elapsed {
        effective_cpu = Trigger::Hold;
        cooldown_blocked = true;
    }
    if memory_trigger == Trigger::Down && !cooldown_elapsed {
        effective_memory = Trigger::Hold;
        cooldown_blocked = true;
    }

    if effective_cpu == Trigger::Hold && effective_memory == Trigger::Hold {
        return SizingOutcome::Skip(if cooldown_blocked {
            SkipReason::Cooldown
        } else {
            SkipReason::WithinThresholds
        });
    }

    let guaranteed = pod_qos == QosClass::Guaranteed && strategy.preserve_guaranteed_qos;

    let mut desired = *current;
    let mut reasons: Vec<String> = Vec::new();

    if effective_cpu != Trigger::Hold {
        let (request, limit) = size_resource(usage.cpu_milli, &strategy.cpu, guaranteed);
        if passes_min_change(current.requests.cpu_milli, request, strategy.min_change_threshold)
            || passes_min_change(current.limits.cpu_milli, limit, strategy.min_change_threshold)
        {
            desired.requests.cpu_milli = Some(request);
            desired.limits.cpu_milli = Some(limit);
            reasons.push(trigger_reason("cpu", effective_cpu, usage.cpu_milli, current.limits.cpu_milli, strategy));
        }
    }

    if effective_memory != Trigger::Hold {
        let (request, limit) = size_resource(usage.memory_mib, &strategy.memory, guaranteed);
        if passes_min_change(current.requests.memory_mib, request, strategy.min_change_threshold)
            || passes_min_change(current.limits.memory_mib, limit, strategy.min_change_threshold)
        {
            desired.requests.memory_mib = Some(request);
            desired.limits.memory_mib = Some(limit);
            reasons.push(trigger_reason("memory", effective_memory, usage.memory_mib, current.limits.memory_mib, strategy));
        }
    }

    if desired == *current {
        return SizingOutcome::Skip(SkipReason::BelowMinChange);
    }

    if guaranteed {
        // A Guaranteed pod must stay Guaranteed: untouched resources keep
        // their equal pair, touched ones were computed with request == limit.
        desired.requests = ResourceAmounts {
            cpu_milli: desired.limits.cpu_milli.or(desired.requests.cpu_milli),
            memory_mib: desired.limits.memory_mib.or(desired.requests.memory_mib),
        };
        desired.limits = desired.requests;
    }

    let direction = direction_of(current, &desired);
    let reason = format!("{} [policy: {}]", reasons.join("; "), strategy.source);

    SizingOutcome::Resize(Proposal {
        container: container.to_string(),
        current: *current,
        desired,
        direction,
        reason,
    })
}

fn trigger(usage: f64, limit: Option<u64>, up: f64, down: f64) -> Trigger {
    match limit {
        // No limit to size against: bootstrap the container once it shows
        // any usage at all.
        None => {
            if usage > 0.0 {
                Trigger::Up
            } else {
                Trigger::Hold
            }
        }
        Some(0) => Trigger::Hold,
        Some(limit) => {
            let utilization = usage / limit as f64;
            if utilization >= up {
                Trigger::Up
            } else if utilization <= down {
                Trigger::Down
            } else {
                Trigger::Hold
            }
        }
    }
}

/// Apply the strategy arithmetic for one resource:
/// request = clamp(ceil(usage · mult) + addition, floor, cap),
/// limit = clamp(ceil(request · mult) + addition, request, cap).
fn size_resource(usage: f64, strategy: &ResourceStrategy, guaranteed: bool) -> (u64, u64) {
    let raw_request = (usage * strategy.request_multiplier).ceil() as u64
        + strategy.request_addition;
    let request = raw_request.clamp(strategy.floor, strategy.cap);

    if guaranteed {
        return (request, request);
    }

    let raw_limit =
        (request as f64 * strategy.limit_multiplier).ceil() as u64 + strategy.limit_addition;
    let limit = raw_limit.clamp(request, strategy.cap);
    (request, limit)
}

/// True when the relative change clears the minimum change threshold.
/// Absent or zero current values always pass (there is nothing to compare).
fn passes_min_change(current: Option<u64>, proposed: u64, threshold: f64) -> bool {
    match current {
        None | Some(0) => true,
        Some(current) => {
            let ratio = (proposed as f64 - current as f64).abs() / current as f64;
            ratio >= threshold
        }
    }
}

fn trigger_reason(
    resource: &str,
    trigger: Trigger,
    usage: f64,
    limit: Option<u64>,
    strategy: &EffectiveStrategy,
) -> String {
    match (trigger, limit) {
        (Trigger::Up, Some(limit)) if limit > 0 => format!(
            "{resource} above scale-up threshold ({:.2} >= {:.2})",
            usage / limit as f64,
            strategy.scale_up_threshold
        ),
        (Trigger::Up, _) => format!("{resource} has no limit to size against"),
        (Trigger::Down, Some(limit)) if limit > 0 => format!(
            "{resource} below scale-down threshold ({:.2} <= {:.2})",
            usage / limit as f64,
            strategy.scale_down_threshold
        ),
        _ => format!("{resource} unchanged"),
    }
}

fn direction_of(current: &ContainerResources, desired: &ContainerResources) -> ResizeDirection {
    let mut up = false;
    let mut down = false;
    for (before, after) in [
        (current.requests.cpu_milli, desired.requests.cpu_milli),
        (current.limits.cpu_milli, desired.limits.cpu_milli),
        (current.requests.memory_mib, desired.requests.memory_mib),
        (current.limits.memory_mib, desired.limits.memory_mib),
    ] {
        match (before, after) {
            (Some(b), Some(a)) if a > b => up = true,
            (Some(b), Some(a)) if a < b => down = true,
            (None, Some(_)) => up = true,
            _ => {}
        }
    }
    match (up, down) {
        (true, false) => ResizeDirection::Up,
        (false, true) => ResizeDirection::Down,
        _ => ResizeDirection::Mixed,
    }
}

/* ============================= TESTS ============================= */
