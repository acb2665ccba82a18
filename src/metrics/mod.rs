pub mod cache;
pub mod metrics_server;
pub mod prometheus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/* ============================= TYPES ============================= */

/// One usage sample for a pod, in internal units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub cpu_milli: f64,
    pub memory_mib: f64,
    pub cpu_throttled_pct: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl Usage {
    pub fn new(cpu_milli: f64, memory_mib: f64) -> Self {
        Self {
            cpu_milli,
            memory_mib,
            cpu_throttled_pct: None,
            observed_at: Utc::now(),
        }
    }
}

/// Usage and capacity for a node, used by the predictive monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUsage {
    pub name: String,
    pub cpu_milli: f64,
    pub memory_mib: f64,
    pub cpu_capacity_milli: f64,
    pub memory_capacity_mib: f64,
}

/* ============================= ERRORS ============================= */

/// Failure classes for metrics lookups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics backend unavailable: {0}")]
    Unavailable(String),

    #[error("no metrics for {0}")]
    NotFound(String),

    #[error("metrics fetch timed out: {0}")]
    Timeout(String),

    #[error("metrics access denied: {0}")]
    Unauthorized(String),

    #[error("metrics error: {0}")]
    Other(String),
}

impl MetricsError {
    /// Transient errors are worth retrying; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, MetricsError::Unavailable(_) | MetricsError::Timeout(_))
    }
}

/* ============================= PROVIDER ============================= */

/// Uniform lookup contract over metrics-server and Prometheus.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_pod_usage(&self, namespace: &str, pod: &str) -> Result<Usage, MetricsError>;
}

/// Node-level usage source; implemented by the metrics-server backend.
#[async_trait]
pub trait NodeMetricsSource: Send + Sync {
    async fn list_node_usage(&self) -> Result<Vec<NodeUsage>, MetricsError>;
}

/* ============================= TESTS ============================= */
