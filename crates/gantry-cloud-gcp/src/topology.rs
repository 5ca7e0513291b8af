//! Cluster topology joins
//!
//! Listener backends are pod IPs. The compute API wants zonal facts the
//! pod itself does not carry: which instance serves the IP, in which
//! zone, on which network. Those are recovered by a three-way join:
//! pod IP/host IP -> node name, node provider id -> zone and instance
//! name, instance NIC -> network and subnetwork.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};

use gantry_api::model::TargetGroup;
use gantry_common::error::{CloudError, Result};

use crate::client::ComputeClient;
use crate::model::Instance;

/// Provider id prefix of GCE-backed nodes
const GCE_PROVIDER_PREFIX: &str = "gce://";

/// Where one backend endpoint lives
#[derive(Clone, Debug)]
pub struct ResolvedEndpoint {
    pub ip: String,
    pub port: i32,
    pub node_name: String,
    /// Instance name, equal to the node name on GKE
    pub instance: String,
    pub network: String,
    pub subnetwork: String,
}

/// Map every live pod IP and host IP in a namespace to its node name
pub async fn node_by_ip(kube: &kube::Client, namespace: &str) -> Result<HashMap<String, String>> {
    let pods: Api<Pod> = Api::namespaced(kube.clone(), namespace);
    let list = pods
        .list(&ListParams::default())
        .await
        .map_err(|err| kube_error("pods", namespace, err))?;
    Ok(index_pod_ips(&list.items))
}

fn index_pod_ips(pods: &[Pod]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for pod in pods {
        let Some(node_name) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) else {
            continue;
        };
        let Some(status) = pod.status.as_ref() else { continue };
        if let Some(pod_ip) = status.pod_ip.clone().filter(|ip| !ip.is_empty()) {
            index.insert(pod_ip, node_name.clone());
        }
        if let Some(host_ip) = status.host_ip.clone().filter(|ip| !ip.is_empty()) {
            index.insert(host_ip, node_name);
        }
    }
    index
}

/// Split a `gce://project/zone/instance` provider id
pub fn parse_provider_id(provider_id: &str) -> Option<(String, String)> {
    let rest = provider_id.strip_prefix(GCE_PROVIDER_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let _project = parts.next()?;
    let zone = parts.next()?;
    let instance = parts.next()?;
    if zone.is_empty() || instance.is_empty() {
        return None;
    }
    Some((zone.to_string(), instance.to_string()))
}

/// Resolve every backend of a target group to its zone, grouped per zone
///
/// Fails when a backend IP matches no pod in the namespace; an endpoint
/// without an instance cannot be attached to an endpoint group.
pub async fn resolve_backends(
    kube: &kube::Client,
    compute: &ComputeClient,
    namespace: &str,
    group: &TargetGroup,
) -> Result<HashMap<String, Vec<ResolvedEndpoint>>> {
    let ip_index = node_by_ip(kube, namespace).await?;
    let nodes: Api<Node> = Api::all(kube.clone());

    let mut node_cache: HashMap<String, (String, String)> = HashMap::new();
    let mut instance_cache: HashMap<String, Instance> = HashMap::new();
    let mut zones: HashMap<String, Vec<ResolvedEndpoint>> = HashMap::new();

    for backend in &group.backends {
        let node_name = ip_index.get(&backend.ip).ok_or_else(|| {
            CloudError::Validation(format!(
                "backend {} does not match any pod in namespace '{}'",
                backend.ip, namespace
            ))
        })?;

        let (zone, instance_name) = match node_cache.get(node_name) {
            Some(entry) => entry.clone(),
            None => {
                let node = nodes
                    .get(node_name)
                    .await
                    .map_err(|err| kube_error("nodes", node_name, err))?;
                let provider_id =
                    node.spec.as_ref().and_then(|spec| spec.provider_id.clone()).unwrap_or_default();
                let entry = parse_provider_id(&provider_id).ok_or_else(|| {
                    CloudError::Operation {
                        name: "ResolveTopology".to_string(),
                        message: format!("node '{}' has no GCE provider id", node_name),
                    }
                })?;
                node_cache.insert(node_name.clone(), entry.clone());
                entry
            }
        };

        let cache_key = format!("{}/{}", zone, instance_name);
        let instance = match instance_cache.entry(cache_key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(compute.get_instance(&zone, &instance_name).await?)
            }
        };
        let nic = instance.network_interfaces.first();

        zones.entry(zone).or_default().push(ResolvedEndpoint {
            ip: backend.ip.clone(),
            port: backend.port,
            node_name: node_name.clone(),
            instance: instance_name,
            network: nic.and_then(|nic| nic.network.clone()).unwrap_or_default(),
            subnetwork: nic.and_then(|nic| nic.subnetwork.clone()).unwrap_or_default(),
        });
    }
    Ok(zones)
}

/// Map a kube API failure onto the error taxonomy
pub(crate) fn kube_error(kind: &str, name: &str, err: kube::Error) -> CloudError {
    match err {
        kube::Error::Api(response) if response.code == 404 => CloudError::not_found(kind, name),
        other => CloudError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn pod(name: &str, node: Option<&str>, pod_ip: Option<&str>, host_ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            spec: Some(PodSpec {
                node_name: node.map(String::from),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: pod_ip.map(String::from),
                host_ip: host_ip.map(String::from),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_and_host_ips_map_to_node() {
        let pods = vec![
            pod("web-0", Some("gke-node-1"), Some("10.8.0.4"), Some("10.128.0.2")),
            pod("web-1", Some("gke-node-2"), Some("10.8.1.9"), None),
            // Unscheduled pods contribute nothing
            pod("pending", None, Some("10.8.2.2"), None),
        ];
        let index = index_pod_ips(&pods);
        assert_eq!(index.get("10.8.0.4").map(String::as_str), Some("gke-node-1"));
        assert_eq!(index.get("10.128.0.2").map(String::as_str), Some("gke-node-1"));
        assert_eq!(index.get("10.8.1.9").map(String::as_str), Some("gke-node-2"));
        assert!(!index.contains_key("10.8.2.2"));
    }

    #[test]
    fn test_provider_id_parsing() {
        assert_eq!(
            parse_provider_id("gce://game-prod/us-central1-b/gke-pool-1-abcd"),
            Some(("us-central1-b".to_string(), "gke-pool-1-abcd".to_string()))
        );
        assert_eq!(parse_provider_id("aws:///i-123"), None);
        assert_eq!(parse_provider_id("gce://game-prod"), None);
        assert_eq!(parse_provider_id(""), None);
    }
}
