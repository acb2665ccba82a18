#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use kube_rightsize::metrics::Usage;
use kube_rightsize::resources::{ContainerResources, ResourceAmounts};

/// Build ResourceRequirements from string quantities.
pub fn requirements(
    requests: &[(&str, &str)],
    limits: &[(&str, &str)],
) -> ResourceRequirements {
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
    ResourceRequirements {
        requests: build(requests),
        limits: build(limits),
        ..Default::default()
    }
}

/// A running single-container pod with the given resources.
pub fn make_test_pod(
    name: &str,
    namespace: &str,
    container: &str,
    resources: ResourceRequirements,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app".to_string(),
                name.to_string(),
            )])),
            owner_references: Some(vec![OwnerReference {
                kind: "ReplicaSet".to_string(),
                name: format!("{name}-5d4f8b9c7f"),
                ..Default::default()
            }]),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-a".to_string()),
            containers: vec![Container {
                name: container.to_string(),
                image: Some("app:2.0".to_string()),
                resources: Some(resources),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: container.to_string(),
                ready: true,
                image: "app:2.0".to_string(),
                image_id: String::new(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Internal-unit container shape.
pub fn shape(req_cpu: u64, lim_cpu: u64, req_mem: u64, lim_mem: u64) -> ContainerResources {
    ContainerResources {
        requests: ResourceAmounts::new(req_cpu, req_mem),
        limits: ResourceAmounts::new(lim_cpu, lim_mem),
    }
}

pub fn usage(cpu_milli: f64, memory_mib: f64) -> Usage {
    Usage::new(cpu_milli, memory_mib)
}
