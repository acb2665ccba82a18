use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/* ============================= TAXONOMY ============================= */

/// Closed event taxonomy under dotted namespaces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    #[serde(rename = "resource.optimized")]
    ResourceOptimized,
    #[serde(rename = "resource.underutilized")]
    ResourceUnderutilized,
    #[serde(rename = "resource.exhaustion")]
    ResourceExhaustion,
    #[serde(rename = "resource.predicted_oom")]
    ResourcePredictedOom,

    #[serde(rename = "pod.predicted_failure")]
    PodPredictedFailure,
    #[serde(rename = "pod.oom_killed")]
    PodOomKilled,
    #[serde(rename = "pod.restarted")]
    PodRestarted,

    #[serde(rename = "node.predicted_failure")]
    NodePredictedFailure,
    #[serde(rename = "node.pressure")]
    NodePressure,

    #[serde(rename = "deployment.scaled")]
    DeploymentScaled,

    #[serde(rename = "system.started")]
    SystemStarted,
    #[serde(rename = "system.stopped")]
    SystemStopped,
    #[serde(rename = "system.config_updated")]
    SystemConfigUpdated,
    #[serde(rename = "system.remediation_proposed")]
    SystemRemediationProposed,
    #[serde(rename = "system.remediation_applied")]
    SystemRemediationApplied,
    #[serde(rename = "system.remediation_failed")]
    SystemRemediationFailed,

    #[serde(rename = "dashboard.sync")]
    DashboardSync,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ResourceOptimized => "resource.optimized",
            EventType::ResourceUnderutilized => "resource.underutilized",
            EventType::ResourceExhaustion => "resource.exhaustion",
            EventType::ResourcePredictedOom => "resource.predicted_oom",
            EventType::PodPredictedFailure => "pod.predicted_failure",
            EventType::PodOomKilled => "pod.oom_killed",
            EventType::PodRestarted => "pod.restarted",
            EventType::NodePredictedFailure => "node.predicted_failure",
            EventType::NodePressure => "node.pressure",
            EventType::DeploymentScaled => "deployment.scaled",
            EventType::SystemStarted => "system.started",
            EventType::SystemStopped => "system.stopped",
            EventType::SystemConfigUpdated => "system.config_updated",
            EventType::SystemRemediationProposed => "system.remediation_proposed",
            EventType::SystemRemediationApplied => "system.remediation_applied",
            EventType::SystemRemediationFailed => "system.remediation_failed",
            EventType::DashboardSync => "dashboard.sync",
        }
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/* ============================= EVENT ============================= */

/// Immutable event record with a stable JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub timestamp: DateTime<Utc>,

    pub cluster_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// The affected resource, usually "pod/<name>" or "node/<name>".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    pub severity: EventSeverity,

    pub message: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,

    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, severity: EventSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            cluster_id: "local".to_string(),
            namespace: None,
            resource: None,
            severity,
            message: message.into(),
            details: BTreeMap::new(),
            tags: BTreeSet::new(),
            source: "kube-rightsize".to_string(),
            correlation_id: None,
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Merge a typed detail record into the details map.
    pub fn details_from(mut self, record: impl Serialize) -> Self {
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(record) {
            for (k, v) in map {
                self.details.insert(k, v);
            }
        }
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn cluster(mut self, id: impl Into<String>) -> Self {
        self.cluster_id = id.into();
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/* ============================= TYPED DETAILS ============================= */

/// Before/after detail record attached to resource-change events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChangeDetails {
    pub container: String,
    pub cpu_request_before_milli: Option<u64>,
    pub cpu_request_after_milli: Option<u64>,
    pub cpu_limit_before_milli: Option<u64>,
    pub cpu_limit_after_milli: Option<u64>,
    pub memory_request_before_mib: Option<u64>,
    pub memory_request_after_mib: Option<u64>,
    pub memory_limit_before_mib: Option<u64>,
    pub memory_limit_after_mib: Option<u64>,
    pub reason: String,
    pub status: String,
}

/// Detail record attached to predictive events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictiveDetails {
    pub predicted_value: f64,
    pub current_limit: f64,
    pub confidence: f64,
    pub method: String,
    /// Human-readable horizon, e.g. "15m0s".
    pub time_to_event: String,
}

/// Detail record attached to remediation lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationDetails {
    pub recommendation_id: String,
    pub action: String,
    pub urgency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/* ============================= FILTER ============================= */

/// Subscription filter. Fields are conjunctive; within a field any listed
/// value matches; required tags must all be present. Empty matches any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub event_types: Vec<EventType>,
    pub namespaces: Vec<String>,
    pub pod_names: Vec<String>,
    pub severities: Vec<EventSeverity>,
    pub tags: Vec<String>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    pub fn namespaces(mut self, namespaces: impl IntoIterator<Item = String>) -> Self {
        self.namespaces = namespaces.into_iter().collect();
        self
    }

    pub fn pod_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.pod_names = names.into_iter().collect();
        self
    }

    pub fn severities(mut self, severities: impl IntoIterator<Item = EventSeverity>) -> Self {
        self.severities = severities.into_iter().collect();
        self
    }

    pub fn require_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&event.severity) {
            return false;
        }
        if !self.namespaces.is_empty() {
            match &event.namespace {
                Some(ns) if self.namespaces.iter().any(|n| n == ns) => {}
                _ => return false,
            }
        }
        if !self.pod_names.is_empty() {
            // Resource strings are "kind/name"; match on the name part.
            let name = event
                .resource
                .as_deref()
                .map(|r| r.rsplit('/').next().unwrap_or(r));
            match name {
                Some(name) if self.pod_names.iter().any(|p| p == name) => {}
                _ => return false,
            }
        }
        self.tags.iter().all(|t| event.tags.contains(t))
    }
}

/* ============================= TESTS ============================= */
