//! Layer-4 listeners on an Azure load balancer
//!
//! One listener owns three sub-resources named `{listener}-{port}`: a
//! backend address pool, a health probe and a load balancing rule. Ensure
//! strips every entry carrying the listener's name prefix and rebuilds the
//! trio from the desired state, so a port change cannot leave stale entries
//! behind; delete strips and writes back.

use tracing::{info, warn};

use gantry_api::model::{Listener, PROTOCOL_HTTP, PROTOCOL_HTTPS, PROTOCOL_TCP, PROTOCOL_UDP};
use gantry_common::error::{CloudError, Result};

use crate::armmodel::{
    BackendAddressPool, BackendAddressPoolProperties, BackendAddressProperties, LoadBalancer,
    LoadBalancerBackendAddress, LoadBalancingRule, LoadBalancingRuleProperties, Probe,
    ProbeProperties, SubResource,
};
use crate::client::ArmClient;
use crate::resource_id::{child_resource_id, listener_resource_name, owned_by};

const COLLECTION_BACKEND_POOLS: &str = "backendAddressPools";
const COLLECTION_PROBES: &str = "probes";
const COLLECTION_RULES: &str = "loadBalancingRules";

/// Converge the load balancer to carry this listener. Returns the ARM id of
/// the load balancing rule.
pub(crate) async fn ensure(client: &ArmClient, listener: &Listener) -> Result<String> {
    let backend_port = listener_backend_port(listener)?;
    let lb_id = client.load_balancer_id(&listener.spec.loadbalancer_id)?;
    let mut lb = client.get_load_balancer(&lb_id).await.map_err(|err| {
        if err.is_not_found() {
            CloudError::LoadBalancerNotFound(listener.spec.loadbalancer_id.clone())
        } else {
            err
        }
    })?;

    let frontend_id = lb
        .properties
        .frontend_ip_configurations
        .first()
        .and_then(|frontend| frontend.id.clone())
        .ok_or_else(|| CloudError::Operation {
            name: "EnsureListener".to_string(),
            message: format!(
                "load balancer '{}' has no frontend IP configuration",
                listener.spec.loadbalancer_id
            ),
        })?;
    let vnet_id = client.virtual_network_id()?;

    apply_listener(&mut lb, listener, backend_port, &frontend_id, &lb_id, &vnet_id);
    client.put_load_balancer(&lb_id, &lb).await?;

    let base = listener_resource_name(listener);
    info!(
        listener = %listener.key(),
        lb = %listener.spec.loadbalancer_id,
        port = listener.spec.port,
        "ensured layer-4 listener"
    );
    Ok(child_resource_id(&lb_id, COLLECTION_RULES, &base))
}

/// Remove every sub-resource this listener owns. Succeeds when the load
/// balancer or the listener's entries are already gone.
pub(crate) async fn delete(client: &ArmClient, listener: &Listener) -> Result<()> {
    let lb_id = client.load_balancer_id(&listener.spec.loadbalancer_id)?;
    let mut lb = match client.get_load_balancer(&lb_id).await {
        Ok(lb) => lb,
        Err(err) if err.is_not_found() => {
            warn!(
                listener = %listener.key(),
                lb = %listener.spec.loadbalancer_id,
                "load balancer already gone, nothing to delete"
            );
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    if strip_owned(&mut lb, listener) == 0 {
        return Ok(());
    }
    client.put_load_balancer(&lb_id, &lb).await?;
    info!(
        listener = %listener.key(),
        lb = %listener.spec.loadbalancer_id,
        "deleted layer-4 listener"
    );
    Ok(())
}

/// The single backend port an Azure load balancing rule can forward to
fn listener_backend_port(listener: &Listener) -> Result<i32> {
    let target_group = listener.spec.target_group.as_ref().ok_or_else(|| {
        CloudError::Validation(format!("listener '{}' has no target group", listener.key()))
    })?;
    target_group.uniform_backend_port().ok_or_else(|| {
        CloudError::Validation(format!(
            "listener '{}' needs at least one backend and a single shared backend port",
            listener.key()
        ))
    })
}

/// Drop every sub-resource carrying the listener's name prefix, returning
/// how many entries were removed
fn strip_owned(lb: &mut LoadBalancer, listener: &Listener) -> usize {
    let before = lb.properties.backend_address_pools.len()
        + lb.properties.probes.len()
        + lb.properties.load_balancing_rules.len();
    lb.properties
        .backend_address_pools
        .retain(|pool| !owned_by(listener, pool.name.as_deref()));
    lb.properties.probes.retain(|probe| !owned_by(listener, probe.name.as_deref()));
    lb.properties
        .load_balancing_rules
        .retain(|rule| !owned_by(listener, rule.name.as_deref()));
    let after = lb.properties.backend_address_pools.len()
        + lb.properties.probes.len()
        + lb.properties.load_balancing_rules.len();
    before - after
}

/// Rewrite the listener's owned sub-resources in place, leaving entries
/// owned by other listeners untouched
fn apply_listener(
    lb: &mut LoadBalancer,
    listener: &Listener,
    backend_port: i32,
    frontend_id: &str,
    lb_id: &str,
    vnet_id: &str,
) {
    strip_owned(lb, listener);
    let base = listener_resource_name(listener);
    lb.properties.backend_address_pools.push(build_pool(&base, listener, vnet_id));
    lb.properties.probes.push(build_probe(&base, backend_port, listener));
    lb.properties
        .load_balancing_rules
        .push(build_rule(&base, listener, backend_port, frontend_id, lb_id));
}

fn build_pool(base: &str, listener: &Listener, vnet_id: &str) -> BackendAddressPool {
    let mut ips: Vec<String> = listener
        .spec
        .target_group
        .iter()
        .flat_map(|tg| tg.backends.iter().map(|backend| backend.ip.clone()))
        .collect();
    ips.sort();
    ips.dedup();

    let addresses = ips
        .into_iter()
        .map(|ip| LoadBalancerBackendAddress {
            name: Some(ip.clone()),
            properties: BackendAddressProperties {
                ip_address: Some(ip),
                virtual_network: Some(SubResource::new(vnet_id.to_string())),
                ..Default::default()
            },
            ..Default::default()
        })
        .collect();

    BackendAddressPool {
        name: Some(base.to_string()),
        properties: BackendAddressPoolProperties {
            load_balancer_backend_addresses: addresses,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// TCP probe against the backend port, upgraded to HTTP when the health
/// check configures a request path
fn build_probe(base: &str, backend_port: i32, listener: &Listener) -> Probe {
    let mut properties = ProbeProperties {
        protocol: "Tcp".to_string(),
        port: backend_port,
        ..Default::default()
    };
    let health = listener
        .spec
        .listener_attribute
        .as_ref()
        .and_then(|attribute| attribute.health_check.as_ref())
        .filter(|check| check.enabled);
    if let Some(check) = health {
        if check.interval_time > 0 {
            properties.interval_in_seconds = Some(check.interval_time);
        }
        if check.unhealthy_threshold > 0 {
            properties.number_of_probes = Some(check.unhealthy_threshold);
        }
        if !check.http_check_path.is_empty() {
            properties.protocol = "Http".to_string();
            properties.request_path = Some(check.http_check_path.clone());
        }
    }
    Probe { name: Some(base.to_string()), properties, ..Default::default() }
}

fn build_rule(
    base: &str,
    listener: &Listener,
    backend_port: i32,
    frontend_id: &str,
    lb_id: &str,
) -> LoadBalancingRule {
    let session_time = listener
        .spec
        .listener_attribute
        .as_ref()
        .map(|attribute| attribute.session_time)
        .unwrap_or(0);
    LoadBalancingRule {
        name: Some(base.to_string()),
        properties: LoadBalancingRuleProperties {
            protocol: arm_protocol(&listener.spec.protocol),
            frontend_port: listener.spec.port,
            backend_port,
            load_distribution: (session_time > 0).then(|| "SourceIP".to_string()),
            frontend_ip_configuration: Some(SubResource::new(frontend_id.to_string())),
            backend_address_pool: Some(SubResource::new(child_resource_id(
                lb_id,
                COLLECTION_BACKEND_POOLS,
                base,
            ))),
            probe: Some(SubResource::new(child_resource_id(lb_id, COLLECTION_PROBES, base))),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// ARM spells protocols in title case
pub(crate) fn arm_protocol(protocol: &str) -> String {
    match protocol.to_uppercase().as_str() {
        PROTOCOL_TCP => "Tcp".to_string(),
        PROTOCOL_UDP => "Udp".to_string(),
        PROTOCOL_HTTP => "Http".to_string(),
        PROTOCOL_HTTPS => "Https".to_string(),
        _ => protocol.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use gantry_api::model::{Backend, HealthCheck, ListenerAttribute, ListenerSpec, TargetGroup};

    use super::*;
    use crate::armmodel::FrontendIpConfiguration;

    const LB_ID: &str =
        "/subscriptions/s/resourceGroups/r/providers/Microsoft.Network/loadBalancers/lb-1";
    const VNET_ID: &str =
        "/subscriptions/s/resourceGroups/r/providers/Microsoft.Network/virtualNetworks/vnet-1";

    fn tcp_listener(name: &str, port: i32, backends: &[(&str, i32)]) -> Listener {
        let spec = ListenerSpec {
            loadbalancer_id: "lb-1".to_string(),
            port,
            protocol: "TCP".to_string(),
            target_group: Some(TargetGroup {
                name: format!("{name}-tg"),
                protocol: "TCP".to_string(),
                backends: backends
                    .iter()
                    .map(|(ip, port)| Backend::new(ip.to_string(), *port))
                    .collect(),
            }),
            ..Default::default()
        };
        Listener::new(name.to_string(), "default".to_string(), spec)
    }

    fn names<T>(items: &[T], name_of: fn(&T) -> Option<&str>) -> Vec<String> {
        items.iter().filter_map(|item| name_of(item).map(String::from)).collect()
    }

    #[test]
    fn test_apply_builds_owned_trio() {
        let listener = tcp_listener("web", 80, &[("10.0.0.2", 8080), ("10.0.0.1", 8080)]);
        let mut lb = LoadBalancer::default();

        apply_listener(&mut lb, &listener, 8080, "fe-1", LB_ID, VNET_ID);

        assert_eq!(names(&lb.properties.backend_address_pools, |p| p.name.as_deref()), ["web-80"]);
        assert_eq!(names(&lb.properties.probes, |p| p.name.as_deref()), ["web-80"]);
        assert_eq!(names(&lb.properties.load_balancing_rules, |r| r.name.as_deref()), ["web-80"]);

        let rule = &lb.properties.load_balancing_rules[0].properties;
        assert_eq!(rule.protocol, "Tcp");
        assert_eq!(rule.frontend_port, 80);
        assert_eq!(rule.backend_port, 8080);
        assert_eq!(rule.load_distribution, None);
        assert!(
            rule.backend_address_pool
                .as_ref()
                .and_then(|p| p.id.as_deref())
                .unwrap()
                .ends_with("/backendAddressPools/web-80")
        );
        assert!(
            rule.probe.as_ref().and_then(|p| p.id.as_deref()).unwrap().ends_with("/probes/web-80")
        );

        // Addresses are sorted and joined to the virtual network
        let addresses =
            &lb.properties.backend_address_pools[0].properties.load_balancer_backend_addresses;
        assert_eq!(addresses[0].properties.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(addresses[1].properties.ip_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(
            addresses[0].properties.virtual_network.as_ref().and_then(|v| v.id.as_deref()),
            Some(VNET_ID)
        );
    }

    #[test]
    fn test_apply_prunes_stale_port_entries() {
        let old = tcp_listener("web", 80, &[("10.0.0.1", 8080)]);
        let mut lb = LoadBalancer::default();
        apply_listener(&mut lb, &old, 8080, "fe-1", LB_ID, VNET_ID);

        // Same listener moved to another frontend port
        let moved = tcp_listener("web", 8443, &[("10.0.0.1", 8080)]);
        apply_listener(&mut lb, &moved, 8080, "fe-1", LB_ID, VNET_ID);

        assert_eq!(
            names(&lb.properties.load_balancing_rules, |r| r.name.as_deref()),
            ["web-8443"]
        );
        assert_eq!(names(&lb.properties.probes, |p| p.name.as_deref()), ["web-8443"]);
    }

    #[test]
    fn test_foreign_entries_survive_apply_and_strip() {
        let other = tcp_listener("api", 9000, &[("10.0.1.1", 9000)]);
        let mut lb = LoadBalancer::default();
        lb.properties.frontend_ip_configurations.push(FrontendIpConfiguration {
            id: Some("fe-1".to_string()),
            name: Some("frontend".to_string()),
            ..Default::default()
        });
        apply_listener(&mut lb, &other, 9000, "fe-1", LB_ID, VNET_ID);

        let web = tcp_listener("web", 80, &[("10.0.0.1", 8080)]);
        apply_listener(&mut lb, &web, 8080, "fe-1", LB_ID, VNET_ID);
        assert_eq!(lb.properties.load_balancing_rules.len(), 2);

        let removed = strip_owned(&mut lb, &web);
        assert_eq!(removed, 3);
        assert_eq!(names(&lb.properties.load_balancing_rules, |r| r.name.as_deref()), ["api-9000"]);
        assert_eq!(strip_owned(&mut lb, &web), 0);
    }

    #[test]
    fn test_probe_upgrades_to_http_with_path() {
        let mut listener = tcp_listener("web", 80, &[("10.0.0.1", 8080)]);
        listener.spec.listener_attribute = Some(ListenerAttribute {
            session_time: 300,
            health_check: Some(HealthCheck {
                enabled: true,
                interval_time: 15,
                unhealthy_threshold: 3,
                http_check_path: "/healthz".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });

        let probe = build_probe("web-80", 8080, &listener);
        assert_eq!(probe.properties.protocol, "Http");
        assert_eq!(probe.properties.request_path.as_deref(), Some("/healthz"));
        assert_eq!(probe.properties.interval_in_seconds, Some(15));
        assert_eq!(probe.properties.number_of_probes, Some(3));

        let rule = build_rule("web-80", &listener, 8080, "fe-1", LB_ID);
        assert_eq!(rule.properties.load_distribution.as_deref(), Some("SourceIP"));
    }

    #[test]
    fn test_backend_port_must_be_uniform() {
        let listener = tcp_listener("web", 80, &[("10.0.0.1", 8080), ("10.0.0.2", 9090)]);
        assert!(matches!(
            listener_backend_port(&listener),
            Err(CloudError::Validation(_))
        ));

        let empty = tcp_listener("web", 80, &[]);
        assert!(listener_backend_port(&empty).is_err());

        let uniform = tcp_listener("web", 80, &[("10.0.0.1", 8080), ("10.0.0.2", 8080)]);
        assert_eq!(listener_backend_port(&uniform).unwrap(), 8080);
    }

    #[test]
    fn test_arm_protocol_spelling() {
        assert_eq!(arm_protocol("TCP"), "Tcp");
        assert_eq!(arm_protocol("udp"), "Udp");
        assert_eq!(arm_protocol("HTTP"), "Http");
        assert_eq!(arm_protocol("HTTPS"), "Https");
    }
}
