use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::Deserialize;

use super::{MetricsError, MetricsProvider, NodeMetricsSource, NodeUsage, Usage};
use crate::resources::{parse_cpu_usage, parse_memory_usage};

/* ============================= WIRE TYPES ============================= */

// The metrics API is an aggregated API without typed bindings here, so we
// deserialize the v1beta1 shapes directly from raw requests.

#[derive(Debug, Deserialize)]
struct PodMetricsItem {
    containers: Vec<ContainerMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetricsItem {
    usage: ResourceUsageItem,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsList {
    items: Vec<NodeMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsItem {
    metadata: NodeMetricsMetadata,
    usage: ResourceUsageItem,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResourceUsageItem {
    cpu: String,
    memory: String,
}

/* ============================= PROVIDER ============================= */

/// metrics-server backend, queried through the aggregated
/// `metrics.k8s.io/v1beta1` API on the apiserver.
pub struct MetricsServerProvider {
    client: Client,
}

impl MetricsServerProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// True when the metrics API group responds at all.
    pub async fn is_available(&self) -> bool {
        let request = http::Request::builder()
            .method("GET")
            .uri("/apis/metrics.k8s.io/v1beta1")
            .body(Vec::new());
        match request {
            Ok(req) => self.client.request::<serde_json::Value>(req).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, MetricsError> {
        let request = http::Request::builder()
            .method("GET")
            .uri(path)
            .body(Vec::new())
            .map_err(|e| MetricsError::Other(format!("request build failed: {e}")))?;

        self.client
            .request::<T>(request)
            .await
            .map_err(|e| classify_kube_error(e, path))
    }
}

fn classify_kube_error(e: kube::Error, subject: &str) -> MetricsError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => MetricsError::NotFound(subject.to_string()),
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            MetricsError::Unauthorized(ae.message.clone())
        }
        kube::Error::Api(ae) if ae.code == 503 => MetricsError::Unavailable(ae.message.clone()),
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            MetricsError::Unavailable(e.to_string())
        }
        _ => MetricsError::Other(e.to_string()),
    }
}

#[async_trait]
impl MetricsProvider for MetricsServerProvider {
    fn name(&self) -> &'static str {
        "metrics-server"
    }

    /// Sum all container usages for the pod: CPU in millicores, memory in MiB.
    async fn fetch_pod_usage(&self, namespace: &str, pod: &str) -> Result<Usage, MetricsError> {
        let path = format!("/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods/{pod}");
        let item: PodMetricsItem = self.get(&path).await?;

        if item.containers.is_empty() {
            return Err(MetricsError::NotFound(format!("{namespace}/{pod}")));
        }

        let mut cpu_milli = 0.0;
        let mut memory_mib = 0.0;
        for container in &item.containers {
            cpu_milli += parse_cpu_usage(&container.usage.cpu);
            memory_mib += parse_memory_usage(&container.usage.memory);
        }

        Ok(Usage::new(cpu_milli, memory_mib))
    }
}

#[async_trait]
impl NodeMetricsSource for MetricsServerProvider {
    async fn list_node_usage(&self) -> Result<Vec<NodeUsage>, MetricsError> {
        let metrics: NodeMetricsList = self.get("/apis/metrics.k8s.io/v1beta1/nodes").await?;

        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| classify_kube_error(e, "nodes"))?;

        let capacity_of = |name: &str| -> (f64, f64) {
            node_list
                .items
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(name))
                .and_then(|n| n.status.as_ref())
                .and_then(|s| s.allocatable.as_ref())
                .map(|alloc| {
                    let cpu = alloc
                        .get("cpu")
                        .map(|q| parse_cpu_usage(&q.0))
                        .unwrap_or(0.0);
                    let mem = alloc
                        .get("memory")
                        .map(|q| parse_memory_usage(&q.0))
                        .unwrap_or(0.0);
                    (cpu, mem)
                })
                .unwrap_or((0.0, 0.0))
        };

        Ok(metrics
            .items
            .into_iter()
            .map(|item| {
                let (cpu_capacity_milli, memory_capacity_mib) = capacity_of(&item.metadata.name);
                NodeUsage {
                    name: item.metadata.name,
                    cpu_milli: parse_cpu_usage(&item.usage.cpu),
                    memory_mib: parse_memory_usage(&item.usage.memory),
                    cpu_capacity_milli,
                    memory_capacity_mib,
                }
            })
            .collect())
    }
}

/* ============================= TESTS ============================= */
