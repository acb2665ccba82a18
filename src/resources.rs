use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/* ============================= ERRORS ============================= */

/// Error parsing a resource quantity string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("invalid CPU quantity '{0}': expected '<n>m' or whole cores")]
    Cpu(String),

    #[error("invalid memory quantity '{0}': expected '<n>', '<n>Mi' or '<n>Gi'")]
    Memory(String),
}

/* ============================= CONFIG QUANTITIES ============================= */

/// Parse a configuration CPU quantity into millicores.
///
/// Accepted forms are a deliberate subset: `"250m"` (millicores) and
/// `"2"` (whole cores, ×1000). Anything else is a parse error.
pub fn parse_cpu(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if let Some(milli) = s.strip_suffix('m') {
        return milli
            .parse::<u64>()
            .map_err(|_| QuantityError::Cpu(s.to_string()));
    }
    s.parse::<u64>()
        .map(|cores| cores * 1000)
        .map_err(|_| QuantityError::Cpu(s.to_string()))
}

/// Parse a configuration memory quantity into MiB.
///
/// Accepted forms: `"64Mi"`, `"1Gi"` (×1024), and bare `"64"` (MiB).
pub fn parse_memory(s: &str) -> Result<u64, QuantityError> {
    let s = s.trim();
    if let Some(mib) = s.strip_suffix("Mi") {
        return mib
            .parse::<u64>()
            .map_err(|_| QuantityError::Memory(s.to_string()));
    }
    if let Some(gib) = s.strip_suffix("Gi") {
        return gib
            .parse::<u64>()
            .map(|g| g * 1024)
            .map_err(|_| QuantityError::Memory(s.to_string()));
    }
    s.parse::<u64>()
        .map_err(|_| QuantityError::Memory(s.to_string()))
}

/// Render millicores as a Kubernetes CPU quantity.
pub fn format_cpu(milli: u64) -> String {
    format!("{milli}m")
}

/// Render MiB as a Kubernetes memory quantity.
pub fn format_memory(mib: u64) -> String {
    format!("{mib}Mi")
}

/* ============================= USAGE QUANTITIES ============================= */

/// Parse a CPU quantity as reported by the metrics API into millicores.
///
/// metrics-server reports nanocores (`"152638716n"`); Prometheus-derived
/// values and pod specs use millicores or cores. All are accepted here.
pub fn parse_cpu_usage(s: &str) -> f64 {
    let s = s.trim();
    if let Some(n) = s.strip_suffix('n') {
        return n.parse::<f64>().map(|v| v / 1_000_000.0).unwrap_or(0.0);
    }
    if let Some(u) = s.strip_suffix('u') {
        return u.parse::<f64>().map(|v| v / 1_000.0).unwrap_or(0.0);
    }
    if let Some(m) = s.strip_suffix('m') {
        return m.parse::<f64>().unwrap_or(0.0);
    }
    s.parse::<f64>().map(|v| v * 1000.0).unwrap_or(0.0)
}

/// Parse a memory quantity as reported by the metrics API into MiB.
pub fn parse_memory_usage(s: &str) -> f64 {
    let s = s.trim();
    if let Some(ki) = s.strip_suffix("Ki") {
        return ki.parse::<f64>().map(|v| v / 1024.0).unwrap_or(0.0);
    }
    if let Some(mi) = s.strip_suffix("Mi") {
        return mi.parse::<f64>().unwrap_or(0.0);
    }
    if let Some(gi) = s.strip_suffix("Gi") {
        return gi.parse::<f64>().map(|v| v * 1024.0).unwrap_or(0.0);
    }
    // Plain bytes
    s.parse::<f64>()
        .map(|v| v / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

/* ============================= AMOUNTS ============================= */

/// CPU (millicores) and memory (MiB) amounts; `None` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceAmounts {
    pub cpu_milli: Option<u64>,
    pub memory_mib: Option<u64>,
}

impl ResourceAmounts {
    pub fn new(cpu_milli: u64, memory_mib: u64) -> Self {
        Self {
            cpu_milli: Some(cpu_milli),
            memory_mib: Some(memory_mib),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_milli.is_none() && self.memory_mib.is_none()
    }
}

/// Requests and limits for a single container, in internal units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerResources {
    pub requests: ResourceAmounts,
    pub limits: ResourceAmounts,
}

impl ContainerResources {
    /// Convert from the Kubernetes API representation.
    ///
    /// Unknown resource names are ignored; cpu/memory values that fail the
    /// strict quantity subset are parse errors, not silently dropped.
    pub fn from_k8s(reqs: &ResourceRequirements) -> Result<Self, QuantityError> {
        let read = |map: &Option<BTreeMap<String, Quantity>>| -> Result<ResourceAmounts, QuantityError> {
            let mut amounts = ResourceAmounts::default();
            if let Some(map) = map {
                if let Some(q) = map.get("cpu") {
                    amounts.cpu_milli = Some(parse_cpu(&q.0)?);
                }
                if let Some(q) = map.get("memory") {
                    amounts.memory_mib = Some(parse_memory(&q.0)?);
                }
            }
            Ok(amounts)
        };

        Ok(Self {
            requests: read(&reqs.requests)?,
            limits: read(&reqs.limits)?,
        })
    }

    /// Convert to the Kubernetes API representation.
    pub fn to_k8s(&self) -> ResourceRequirements {
        let write = |amounts: &ResourceAmounts| -> Option<BTreeMap<String, Quantity>> {
            if amounts.is_empty() {
                return None;
            }
            let mut map = BTreeMap::new();
            if let Some(cpu) = amounts.cpu_milli {
                map.insert("cpu".to_string(), Quantity(format_cpu(cpu)));
            }
            if let Some(mem) = amounts.memory_mib {
                map.insert("memory".to_string(), Quantity(format_memory(mem)));
            }
            Some(map)
        };

        ResourceRequirements {
            requests: write(&self.requests),
            limits: write(&self.limits),
            ..Default::default()
        }
    }
}

/* ============================= QOS ============================= */

/// Kubernetes Quality-of-Service class, derived from container resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QosClass::Guaranteed => "Guaranteed",
            QosClass::Burstable => "Burstable",
            QosClass::BestEffort => "BestEffort",
        }
    }
}

/// Derive the QoS class for a set of containers.
///
/// Guaranteed: every container sets both cpu and memory with
/// requests == limits. BestEffort: no container sets anything.
/// Everything else is Burstable.
pub fn qos_class(containers: &[ContainerResources]) -> QosClass {
    if containers.is_empty() {
        return QosClass::BestEffort;
    }

    let all_guaranteed = containers.iter().all(|c| {
        c.requests.cpu_milli.is_some()
            && c.requests.memory_mib.is_some()
            && c.requests.cpu_milli == c.limits.cpu_milli
            && c.requests.memory_mib == c.limits.memory_mib
    });
    if all_guaranteed {
        return QosClass::Guaranteed;
    }

    let any_set = containers
        .iter()
        .any(|c| !c.requests.is_empty() || !c.limits.is_empty());
    if any_set {
        QosClass::Burstable
    } else {
        QosClass::BestEffort
    }
}

/* ============================= TESTS ============================= */
