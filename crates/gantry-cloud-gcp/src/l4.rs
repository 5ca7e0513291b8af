//! Layer-4 listeners as Kubernetes Service objects
//!
//! GCP network load balancers are not driven directly: the in-cluster
//! cloud provider already reconciles `Service` objects of type
//! LoadBalancer. A layer-4 listener therefore materializes as a Service
//! with a pinned frontend IP plus a hand-built `Endpoints` object, since
//! the backends are pod IPs and no selector describes them.

use k8s_openapi::api::core::v1::{
    ClientIPConfig, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
    ServicePort, ServiceSpec, SessionAffinityConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use gantry_api::model::{
    BackendHealthStatus, HEALTH_STATUS_HEALTHY, HEALTH_STATUS_UNHEALTHY, Listener,
};
use gantry_common::error::{CloudError, Result};

use crate::link::{is_ip_address, listener_resource_name};
use crate::topology::{self, kube_error};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "gantry";

const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";
const TRAFFIC_POLICY_LOCAL: &str = "Local";
const SESSION_AFFINITY_CLIENT_IP: &str = "ClientIP";

/// Converge the Service and Endpoints pair of one listener
pub(crate) async fn ensure(kube: &kube::Client, listener: &Listener) -> Result<String> {
    let backend_port = listener_backend_port(listener)?;
    let name = listener_resource_name(listener);
    let node_index = topology::node_by_ip(kube, &listener.namespace).await?;

    let service = build_service(listener, &name, backend_port);
    let endpoints = build_endpoints(listener, &name, backend_port, &node_index);

    upsert_service(kube, listener, &name, service).await?;
    upsert_endpoints(kube, listener, &name, endpoints).await?;

    info!(
        listener = %listener.key(),
        service = %name,
        port = listener.spec.port,
        backend_port,
        "ensured load balancer service"
    );
    Ok(format!("{}/{}", listener.namespace, name))
}

/// Remove the Service and Endpoints pair; both tolerate being gone
pub(crate) async fn delete(kube: &kube::Client, listener: &Listener) -> Result<()> {
    let name = listener_resource_name(listener);
    let services: Api<Service> = Api::namespaced(kube.clone(), &listener.namespace);
    let endpoints: Api<Endpoints> = Api::namespaced(kube.clone(), &listener.namespace);

    match services.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 404 => {
            warn!(listener = %listener.key(), service = %name, "service already absent");
        }
        Err(err) => return Err(kube_error("services", &name, err)),
    }
    match endpoints.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(listener = %listener.key(), endpoints = %name, "endpoints already absent");
        }
        Err(err) => return Err(kube_error("endpoints", &name, err)),
    }
    info!(listener = %listener.key(), service = %name, "deleted load balancer service");
    Ok(())
}

/// Backend health of the services that answer on one frontend address
///
/// The cloud provider exposes no per-backend probe results for network
/// load balancers; what the cluster records in `Endpoints` is the
/// observable truth.
pub(crate) async fn backend_status(
    kube: &kube::Client,
    namespace: &str,
    address: &str,
) -> Result<Vec<BackendHealthStatus>> {
    let services: Api<Service> = Api::namespaced(kube.clone(), namespace);
    let endpoints: Api<Endpoints> = Api::namespaced(kube.clone(), namespace);
    let list = services
        .list(&Default::default())
        .await
        .map_err(|err| kube_error("services", namespace, err))?;

    let mut statuses = Vec::new();
    for service in &list.items {
        if !service_answers_on(service, address) {
            continue;
        }
        let Some(name) = service.metadata.name.as_deref() else { continue };
        let Some(object) = endpoints
            .get_opt(name)
            .await
            .map_err(|err| kube_error("endpoints", name, err))?
        else {
            continue;
        };
        collect_endpoint_statuses(&object, name, service_port(service), &mut statuses);
    }
    Ok(statuses)
}

/// Backend health of one service named directly as `namespace/name`
pub(crate) async fn backend_status_by_name(
    kube: &kube::Client,
    namespace: &str,
    name: &str,
) -> Result<Vec<BackendHealthStatus>> {
    let services: Api<Service> = Api::namespaced(kube.clone(), namespace);
    let Some(service) =
        services.get_opt(name).await.map_err(|err| kube_error("services", name, err))?
    else {
        return Ok(Vec::new());
    };
    let endpoints: Api<Endpoints> = Api::namespaced(kube.clone(), namespace);
    let Some(object) =
        endpoints.get_opt(name).await.map_err(|err| kube_error("endpoints", name, err))?
    else {
        return Ok(Vec::new());
    };
    let mut statuses = Vec::new();
    collect_endpoint_statuses(&object, name, service_port(&service), &mut statuses);
    Ok(statuses)
}

/// Frontend port of a single-port service
fn service_port(service: &Service) -> i32 {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.port)
        .unwrap_or(0)
}

/// Whether a service fronts the given address, pinned or assigned
fn service_answers_on(service: &Service, address: &str) -> bool {
    if let Some(spec) = &service.spec {
        if spec.load_balancer_ip.as_deref() == Some(address) {
            return true;
        }
    }
    service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| {
            ingress.iter().any(|entry| entry.ip.as_deref() == Some(address))
        })
}

fn collect_endpoint_statuses(
    object: &Endpoints,
    service_name: &str,
    listener_port: i32,
    statuses: &mut Vec<BackendHealthStatus>,
) {
    for subset in object.subsets.iter().flatten() {
        let (port, protocol) = subset
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|port| (port.port, port.protocol.clone().unwrap_or_default()))
            .unwrap_or((0, String::new()));
        let mut push = |addresses: &Option<Vec<EndpointAddress>>, healthy: bool| {
            for address in addresses.iter().flatten() {
                statuses.push(BackendHealthStatus {
                    ip: address.ip.clone(),
                    port,
                    protocol: protocol.to_uppercase(),
                    listener_port,
                    healthy,
                    status: if healthy {
                        HEALTH_STATUS_HEALTHY.to_string()
                    } else {
                        HEALTH_STATUS_UNHEALTHY.to_string()
                    },
                    target_group_name: Some(service_name.to_string()),
                });
            }
        };
        push(&subset.addresses, true);
        push(&subset.not_ready_addresses, false);
    }
}

/// The single backend port a Service can forward one frontend port to
fn listener_backend_port(listener: &Listener) -> Result<i32> {
    listener
        .spec
        .target_group
        .as_ref()
        .and_then(|group| group.uniform_backend_port())
        .ok_or_else(|| {
            CloudError::Validation(format!(
                "listener '{}' needs at least one backend and a single shared backend port",
                listener.name
            ))
        })
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

fn build_service(listener: &Listener, name: &str, backend_port: i32) -> Service {
    let protocol = listener.spec.protocol.to_uppercase();
    let attribute = listener.spec.listener_attribute.as_ref();
    let session_time = attribute.map(|attribute| attribute.session_time).unwrap_or(0);

    // A non-IP loadbalancer id cannot be pinned; the cloud provider then
    // assigns an address on its own
    let load_balancer_ip = Some(listener.spec.loadbalancer_id.clone())
        .filter(|value| is_ip_address(value));

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(listener.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(SERVICE_TYPE_LOAD_BALANCER.to_string()),
            external_traffic_policy: Some(TRAFFIC_POLICY_LOCAL.to_string()),
            load_balancer_ip,
            // Backends are pod IPs; the endpoints object is hand-built
            selector: None,
            ports: Some(vec![ServicePort {
                port: listener.spec.port,
                target_port: Some(IntOrString::Int(backend_port)),
                protocol: Some(protocol),
                ..Default::default()
            }]),
            session_affinity: (session_time > 0)
                .then(|| SESSION_AFFINITY_CLIENT_IP.to_string()),
            session_affinity_config: (session_time > 0).then(|| SessionAffinityConfig {
                client_ip: Some(ClientIPConfig { timeout_seconds: Some(session_time) }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_endpoints(
    listener: &Listener,
    name: &str,
    backend_port: i32,
    node_index: &HashMap<String, String>,
) -> Endpoints {
    let protocol = listener.spec.protocol.to_uppercase();
    let mut ips: Vec<&str> = listener
        .spec
        .target_group
        .iter()
        .flat_map(|group| group.backends.iter())
        .map(|backend| backend.ip.as_str())
        .collect();
    ips.sort_unstable();
    ips.dedup();

    let addresses: Vec<EndpointAddress> = ips
        .into_iter()
        .map(|ip| EndpointAddress {
            ip: ip.to_string(),
            node_name: node_index.get(ip).cloned(),
            ..Default::default()
        })
        .collect();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(listener.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            not_ready_addresses: None,
            ports: Some(vec![EndpointPort {
                port: backend_port,
                protocol: Some(protocol),
                ..Default::default()
            }]),
        }]),
    }
}

/// Carry the server-owned fields of the live Service into the desired one
/// so a replace neither re-allocates ports nor trips on immutable fields
fn merge_existing_service(desired: &mut Service, existing: &Service) {
    desired.metadata.resource_version = existing.metadata.resource_version.clone();
    let Some(spec) = desired.spec.as_mut() else { return };
    let Some(existing_spec) = existing.spec.as_ref() else { return };
    spec.cluster_ip = existing_spec.cluster_ip.clone();
    spec.cluster_ips = existing_spec.cluster_ips.clone();
    spec.health_check_node_port = existing_spec.health_check_node_port;
    if let (Some(ports), Some(existing_ports)) = (spec.ports.as_mut(), existing_spec.ports.as_ref())
    {
        for port in ports.iter_mut() {
            if let Some(previous) = existing_ports.iter().find(|p| p.port == port.port) {
                port.node_port = previous.node_port;
            }
        }
    }
}

async fn upsert_service(
    kube: &kube::Client,
    listener: &Listener,
    name: &str,
    mut service: Service,
) -> Result<()> {
    let api: Api<Service> = Api::namespaced(kube.clone(), &listener.namespace);
    match api.get_opt(name).await.map_err(|err| kube_error("services", name, err))? {
        Some(existing) => {
            merge_existing_service(&mut service, &existing);
            api.replace(name, &PostParams::default(), &service)
                .await
                .map_err(|err| kube_error("services", name, err))?;
        }
        None => {
            api.create(&PostParams::default(), &service)
                .await
                .map_err(|err| kube_error("services", name, err))?;
        }
    }
    Ok(())
}

async fn upsert_endpoints(
    kube: &kube::Client,
    listener: &Listener,
    name: &str,
    mut endpoints: Endpoints,
) -> Result<()> {
    let api: Api<Endpoints> = Api::namespaced(kube.clone(), &listener.namespace);
    match api.get_opt(name).await.map_err(|err| kube_error("endpoints", name, err))? {
        Some(existing) => {
            endpoints.metadata.resource_version = existing.metadata.resource_version;
            api.replace(name, &PostParams::default(), &endpoints)
                .await
                .map_err(|err| kube_error("endpoints", name, err))?;
        }
        None => {
            api.create(&PostParams::default(), &endpoints)
                .await
                .map_err(|err| kube_error("endpoints", name, err))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use gantry_api::model::{Backend, ListenerAttribute, ListenerSpec, TargetGroup};

    use super::*;

    fn listener(lb_id: &str, session_time: i32) -> Listener {
        Listener::new(
            "game-tcp".to_string(),
            "prod".to_string(),
            ListenerSpec {
                loadbalancer_id: lb_id.to_string(),
                port: 7777,
                protocol: "TCP".to_string(),
                target_group: Some(TargetGroup {
                    name: "game".to_string(),
                    protocol: "TCP".to_string(),
                    backends: vec![
                        Backend::new("10.8.0.9".to_string(), 7777),
                        Backend::new("10.8.0.4".to_string(), 7777),
                        Backend::new("10.8.0.4".to_string(), 7777),
                    ],
                }),
                listener_attribute: (session_time > 0).then(|| ListenerAttribute {
                    session_time,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_service_shape() {
        let l = listener("203.0.113.9", 0);
        let service = build_service(&l, "game-tcp-7777", 7777);
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.external_traffic_policy.as_deref(), Some("Local"));
        assert_eq!(spec.load_balancer_ip.as_deref(), Some("203.0.113.9"));
        assert!(spec.selector.is_none());
        assert!(spec.session_affinity.is_none());
        let ports = spec.ports.unwrap();
        assert_eq!(ports[0].port, 7777);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(7777)));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
    }

    #[test]
    fn test_non_ip_lb_id_is_not_pinned() {
        let l = listener("projects/p/global/addresses/edge", 0);
        let service = build_service(&l, "game-tcp-7777", 7777);
        assert!(service.spec.unwrap().load_balancer_ip.is_none());
    }

    #[test]
    fn test_session_time_becomes_client_ip_affinity() {
        let l = listener("203.0.113.9", 300);
        let spec = build_service(&l, "game-tcp-7777", 7777).spec.unwrap();
        assert_eq!(spec.session_affinity.as_deref(), Some("ClientIP"));
        let timeout = spec
            .session_affinity_config
            .unwrap()
            .client_ip
            .unwrap()
            .timeout_seconds
            .unwrap();
        assert_eq!(timeout, 300);
    }

    #[test]
    fn test_endpoints_sorted_deduped_with_node_names() {
        let l = listener("203.0.113.9", 0);
        let index = HashMap::from([("10.8.0.4".to_string(), "gke-node-1".to_string())]);
        let endpoints = build_endpoints(&l, "game-tcp-7777", 7777, &index);
        let subsets = endpoints.subsets.unwrap();
        let addresses = subsets[0].addresses.as_ref().unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].ip, "10.8.0.4");
        assert_eq!(addresses[0].node_name.as_deref(), Some("gke-node-1"));
        assert_eq!(addresses[1].ip, "10.8.0.9");
        assert!(addresses[1].node_name.is_none());
        assert_eq!(subsets[0].ports.as_ref().unwrap()[0].port, 7777);
    }

    #[test]
    fn test_replace_keeps_server_owned_fields() {
        let l = listener("203.0.113.9", 0);
        let mut desired = build_service(&l, "game-tcp-7777", 7777);
        let mut existing = build_service(&l, "game-tcp-7777", 7777);
        existing.metadata.resource_version = Some("4711".to_string());
        {
            let spec = existing.spec.as_mut().unwrap();
            spec.cluster_ip = Some("10.96.0.17".to_string());
            spec.cluster_ips = Some(vec!["10.96.0.17".to_string()]);
            spec.health_check_node_port = Some(32100);
            spec.ports.as_mut().unwrap()[0].node_port = Some(31234);
        }

        merge_existing_service(&mut desired, &existing);
        assert_eq!(desired.metadata.resource_version.as_deref(), Some("4711"));
        let spec = desired.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.17"));
        assert_eq!(spec.health_check_node_port, Some(32100));
        assert_eq!(spec.ports.unwrap()[0].node_port, Some(31234));
    }

    #[test]
    fn test_mixed_backend_ports_rejected() {
        let mut l = listener("203.0.113.9", 0);
        if let Some(group) = l.spec.target_group.as_mut() {
            group.backends[1].port = 9999;
        }
        assert!(listener_backend_port(&l).is_err());
        assert_eq!(listener_backend_port(&listener("203.0.113.9", 0)).unwrap(), 7777);
    }

    #[test]
    fn test_ready_and_not_ready_addresses() {
        let object = Endpoints {
            metadata: ObjectMeta::default(),
            subsets: Some(vec![subset_fixture()]),
        };
        let mut statuses = Vec::new();
        collect_endpoint_statuses(&object, "game-tcp-7777", 7777, &mut statuses);
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].healthy);
        assert_eq!(statuses[0].status, HEALTH_STATUS_HEALTHY);
        assert_eq!(statuses[0].listener_port, 7777);
        assert!(!statuses[1].healthy);
        assert_eq!(statuses[1].ip, "10.8.0.9");
    }

    fn subset_fixture() -> EndpointSubset {
        EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.8.0.4".to_string(),
                ..Default::default()
            }]),
            not_ready_addresses: Some(vec![EndpointAddress {
                ip: "10.8.0.9".to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort { port: 7777, protocol: Some("TCP".to_string()), ..Default::default() }]),
        }
    }
}
