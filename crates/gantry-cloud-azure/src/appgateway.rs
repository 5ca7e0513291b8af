//! Layer-7 listeners on an Azure application gateway
//!
//! A listener materializes as one frontend port, one HTTP listener and one
//! request routing rule, all named `{listener}-{port}`, plus a backend
//! group (address pool, HTTP settings, optional probe) per routing target:
//! `{base}-default` for the listener-level target group and
//! `{listener}-{hash}` per rule. Rules route through a URL path map; a
//! listener without rules routes straight to the default group.
//!
//! Certificates are referenced by name or id and must already exist on the
//! gateway; the reconciler never uploads certificate material.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use gantry_api::model::{
    BackendHealthStatus, HEALTH_STATUS_HEALTHY, HEALTH_STATUS_UNHEALTHY, HEALTH_STATUS_UNKNOWN,
    Listener, ListenerAttribute, PROTOCOL_HTTPS, TargetGroup,
};
use gantry_common::error::{CloudError, Result};

use crate::armmodel::{
    AppGatewayBackendAddress, AppGatewayBackendHttpSettings, AppGatewayBackendHttpSettingsProperties,
    AppGatewayBackendPool, AppGatewayBackendPoolProperties, AppGatewayFrontendPort,
    AppGatewayFrontendPortProperties, AppGatewayHttpListener, AppGatewayHttpListenerProperties,
    AppGatewayPathRule, AppGatewayPathRuleProperties, AppGatewayProbe, AppGatewayProbeMatch,
    AppGatewayProbeProperties, AppGatewayRequestRoutingRule, AppGatewayRequestRoutingRuleProperties,
    AppGatewayUrlPathMap, AppGatewayUrlPathMapProperties, ApplicationGateway,
    ApplicationGatewayBackendHealth, BACKEND_SERVER_HEALTHY, BACKEND_SERVER_UNHEALTHY, SubResource,
};
use crate::client::ArmClient;
use crate::loadbalancer::arm_protocol;
use crate::resource_id::{
    child_resource_id, is_resource_id, listener_resource_name, owned_by, resource_name,
    rule_resource_name,
};

const COLLECTION_FRONTEND_PORTS: &str = "frontendPorts";
const COLLECTION_SSL_CERTIFICATES: &str = "sslCertificates";
const COLLECTION_BACKEND_POOLS: &str = "backendAddressPools";
const COLLECTION_PROBES: &str = "probes";
const COLLECTION_HTTP_SETTINGS: &str = "backendHttpSettingsCollection";
const COLLECTION_HTTP_LISTENERS: &str = "httpListeners";
const COLLECTION_URL_PATH_MAPS: &str = "urlPathMaps";
const COLLECTION_ROUTING_RULES: &str = "requestRoutingRules";

const AFFINITY_ENABLED: &str = "Enabled";
const AFFINITY_DISABLED: &str = "Disabled";
const RULE_TYPE_BASIC: &str = "Basic";
const RULE_TYPE_PATH_BASED: &str = "PathBasedRouting";
/// ARM accepts routing rule priorities 1..=20000
const MAX_RULE_PRIORITY: i32 = 20_000;

const DEFAULT_PROBE_INTERVAL: i32 = 30;
const DEFAULT_PROBE_TIMEOUT: i32 = 30;
const DEFAULT_PROBE_UNHEALTHY_THRESHOLD: i32 = 3;
/// Probe host when no rule domain supplies one
const DEFAULT_PROBE_HOST: &str = "127.0.0.1";

/// Converge the application gateway to carry this listener. Returns the
/// ARM id of the HTTP listener.
pub(crate) async fn ensure(client: &ArmClient, listener: &Listener) -> Result<String> {
    let gateway_id = client.application_gateway_id(&listener.spec.loadbalancer_id)?;
    let mut gateway = client.get_application_gateway(&gateway_id).await.map_err(|err| {
        if err.is_not_found() {
            CloudError::LoadBalancerNotFound(listener.spec.loadbalancer_id.clone())
        } else {
            err
        }
    })?;

    apply_listener(&mut gateway, listener, &gateway_id)?;
    client.put_application_gateway(&gateway_id, &gateway).await?;

    info!(
        listener = %listener.key(),
        gateway = %listener.spec.loadbalancer_id,
        port = listener.spec.port,
        rules = listener.spec.rules.len(),
        "ensured layer-7 listener"
    );
    Ok(child_resource_id(&gateway_id, COLLECTION_HTTP_LISTENERS, &listener_resource_name(listener)))
}

/// Remove every sub-resource this listener owns. Succeeds when the gateway
/// or the listener's entries are already gone.
pub(crate) async fn delete(client: &ArmClient, listener: &Listener) -> Result<()> {
    let gateway_id = client.application_gateway_id(&listener.spec.loadbalancer_id)?;
    let mut gateway = match client.get_application_gateway(&gateway_id).await {
        Ok(gateway) => gateway,
        Err(err) if err.is_not_found() => {
            warn!(
                listener = %listener.key(),
                gateway = %listener.spec.loadbalancer_id,
                "application gateway already gone, nothing to delete"
            );
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    if strip_owned(&mut gateway, listener) == 0 {
        return Ok(());
    }
    client.put_application_gateway(&gateway_id, &gateway).await?;
    info!(
        listener = %listener.key(),
        gateway = %listener.spec.loadbalancer_id,
        "deleted layer-7 listener"
    );
    Ok(())
}

/// Backend health of every pool on the gateway, resolved back to listener
/// frontend ports through the routing graph
pub(crate) async fn backend_status(
    client: &ArmClient,
    lb_id: &str,
) -> Result<Vec<BackendHealthStatus>> {
    let gateway_id = client.application_gateway_id(lb_id)?;
    let gateway = client.get_application_gateway(&gateway_id).await?;
    let health = client.application_gateway_backend_health(&gateway_id).await?;
    Ok(map_backend_health(&gateway, &health))
}

/// One address pool with its HTTP settings and optional probe
struct BackendGroup {
    pool: AppGatewayBackendPool,
    settings: AppGatewayBackendHttpSettings,
    probe: Option<AppGatewayProbe>,
}

/// Rewrite the listener's owned sub-resources in place, leaving entries
/// owned by other listeners untouched
fn apply_listener(
    gateway: &mut ApplicationGateway,
    listener: &Listener,
    gateway_id: &str,
) -> Result<()> {
    let base = listener_resource_name(listener);
    let frontend_id = gateway
        .properties
        .frontend_ip_configurations
        .first()
        .and_then(|frontend| frontend.id.clone())
        .ok_or_else(|| CloudError::Operation {
            name: "EnsureListener".to_string(),
            message: format!(
                "application gateway '{}' has no frontend IP configuration",
                listener.spec.loadbalancer_id
            ),
        })?;

    let listener_attribute = listener.spec.listener_attribute.as_ref();
    let default_name = format!("{base}-default");
    let default_group = listener
        .spec
        .target_group
        .as_ref()
        .map(|tg| build_backend_group(&default_name, tg, listener_attribute, None, gateway_id))
        .transpose()?;

    let mut rule_groups = Vec::new();
    let mut path_rules = Vec::new();
    let mut seen_paths: HashSet<String> = HashSet::new();
    for rule in &listener.spec.rules {
        let Some(target_group) = rule.target_group.as_ref() else {
            return Err(CloudError::Validation(format!(
                "rule '{}' of listener '{}' has no target group",
                rule.key(),
                listener.key()
            )));
        };
        let path = path_pattern(&rule.path);
        // Path patterns must be unique within one map
        if !seen_paths.insert(path.clone()) {
            warn!(
                listener = %listener.key(),
                rule = %rule.key(),
                "skipping rule, path pattern already routed"
            );
            continue;
        }

        let group_name = rule_resource_name(listener, rule);
        let attribute = rule.listener_attribute.as_ref().or(listener_attribute);
        let host = (!rule.domain.is_empty()).then_some(rule.domain.as_str());
        rule_groups.push(build_backend_group(&group_name, target_group, attribute, host, gateway_id)?);
        path_rules.push(AppGatewayPathRule {
            name: Some(group_name.clone()),
            properties: AppGatewayPathRuleProperties {
                paths: vec![path],
                backend_address_pool: Some(ref_of(gateway_id, COLLECTION_BACKEND_POOLS, &group_name)),
                backend_http_settings: Some(ref_of(gateway_id, COLLECTION_HTTP_SETTINGS, &group_name)),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    // Path maps and basic rules both need a default target; fall back to
    // the first rule's group when the listener has no top-level one
    let default_ref = match (&default_group, listener.spec.rules.first()) {
        (Some(_), _) => default_name.clone(),
        (None, Some(rule)) => rule_resource_name(listener, rule),
        (None, None) => {
            return Err(CloudError::Validation(format!(
                "listener '{}' needs a target group or at least one rule",
                listener.key()
            )));
        }
    };

    let is_https = listener.spec.protocol.to_uppercase() == PROTOCOL_HTTPS;
    let ssl_certificate = if is_https {
        let certificate = listener
            .spec
            .certificate
            .as_ref()
            .filter(|certificate| !certificate.cert_id.is_empty())
            .ok_or_else(|| {
                CloudError::Validation(format!(
                    "HTTPS listener '{}' needs a certificate",
                    listener.key()
                ))
            })?;
        Some(certificate_ref(gateway_id, &certificate.cert_id))
    } else {
        None
    };

    let http_listener = AppGatewayHttpListener {
        name: Some(base.clone()),
        properties: AppGatewayHttpListenerProperties {
            frontend_ip_configuration: Some(SubResource::new(frontend_id)),
            frontend_port: Some(ref_of(gateway_id, COLLECTION_FRONTEND_PORTS, &base)),
            protocol: if is_https { "Https" } else { "Http" }.to_string(),
            ssl_certificate,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut routing_properties = AppGatewayRequestRoutingRuleProperties {
        rule_type: RULE_TYPE_BASIC.to_string(),
        priority: Some(listener.spec.port.clamp(1, MAX_RULE_PRIORITY)),
        http_listener: Some(ref_of(gateway_id, COLLECTION_HTTP_LISTENERS, &base)),
        ..Default::default()
    };
    let mut url_path_map = None;
    if path_rules.is_empty() {
        routing_properties.backend_address_pool =
            Some(ref_of(gateway_id, COLLECTION_BACKEND_POOLS, &default_ref));
        routing_properties.backend_http_settings =
            Some(ref_of(gateway_id, COLLECTION_HTTP_SETTINGS, &default_ref));
    } else {
        url_path_map = Some(AppGatewayUrlPathMap {
            name: Some(base.clone()),
            properties: AppGatewayUrlPathMapProperties {
                default_backend_address_pool: Some(ref_of(
                    gateway_id,
                    COLLECTION_BACKEND_POOLS,
                    &default_ref,
                )),
                default_backend_http_settings: Some(ref_of(
                    gateway_id,
                    COLLECTION_HTTP_SETTINGS,
                    &default_ref,
                )),
                path_rules,
                ..Default::default()
            },
            ..Default::default()
        });
        routing_properties.rule_type = RULE_TYPE_PATH_BASED.to_string();
        routing_properties.url_path_map = Some(ref_of(gateway_id, COLLECTION_URL_PATH_MAPS, &base));
    }

    strip_owned(gateway, listener);
    let properties = &mut gateway.properties;
    properties.frontend_ports.push(AppGatewayFrontendPort {
        name: Some(base.clone()),
        properties: AppGatewayFrontendPortProperties {
            port: listener.spec.port,
            ..Default::default()
        },
        ..Default::default()
    });
    for group in default_group.into_iter().chain(rule_groups) {
        properties.backend_address_pools.push(group.pool);
        if let Some(probe) = group.probe {
            properties.probes.push(probe);
        }
        properties.backend_http_settings_collection.push(group.settings);
    }
    properties.http_listeners.push(http_listener);
    if let Some(map) = url_path_map {
        properties.url_path_maps.push(map);
    }
    properties.request_routing_rules.push(AppGatewayRequestRoutingRule {
        name: Some(base),
        properties: routing_properties,
        ..Default::default()
    });
    Ok(())
}

fn build_backend_group(
    name: &str,
    target_group: &TargetGroup,
    attribute: Option<&ListenerAttribute>,
    host: Option<&str>,
    gateway_id: &str,
) -> Result<BackendGroup> {
    let backend_port = target_group.uniform_backend_port().ok_or_else(|| {
        CloudError::Validation(format!(
            "target group '{}' needs at least one backend and a single shared backend port",
            target_group.name
        ))
    })?;
    // The gateway only speaks HTTP(S) toward backends
    let protocol = match arm_protocol(&target_group.protocol).as_str() {
        "Https" => "Https".to_string(),
        _ => "Http".to_string(),
    };

    let mut ips: Vec<String> =
        target_group.backends.iter().map(|backend| backend.ip.clone()).collect();
    ips.sort();
    ips.dedup();
    let pool = AppGatewayBackendPool {
        name: Some(name.to_string()),
        properties: AppGatewayBackendPoolProperties {
            backend_addresses: ips
                .into_iter()
                .map(|ip| AppGatewayBackendAddress { ip_address: Some(ip), ..Default::default() })
                .collect(),
            ..Default::default()
        },
        ..Default::default()
    };

    let health = attribute
        .and_then(|attribute| attribute.health_check.as_ref())
        .filter(|check| check.enabled);
    let probe = health.map(|check| AppGatewayProbe {
        name: Some(name.to_string()),
        properties: AppGatewayProbeProperties {
            protocol: protocol.clone(),
            path: if check.http_check_path.is_empty() {
                "/".to_string()
            } else {
                check.http_check_path.clone()
            },
            interval: positive_or(check.interval_time, DEFAULT_PROBE_INTERVAL),
            timeout: positive_or(check.timeout, DEFAULT_PROBE_TIMEOUT),
            unhealthy_threshold: positive_or(
                check.unhealthy_threshold,
                DEFAULT_PROBE_UNHEALTHY_THRESHOLD,
            ),
            host: Some(host.unwrap_or(DEFAULT_PROBE_HOST).to_string()),
            r#match: check.http_code.as_ref().map(|codes| AppGatewayProbeMatch {
                status_codes: codes.split(',').map(|code| code.trim().to_string()).collect(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    });

    let session_time = attribute.map(|attribute| attribute.session_time).unwrap_or(0);
    let settings = AppGatewayBackendHttpSettings {
        name: Some(name.to_string()),
        properties: AppGatewayBackendHttpSettingsProperties {
            port: backend_port,
            protocol,
            cookie_based_affinity: if session_time > 0 { AFFINITY_ENABLED } else { AFFINITY_DISABLED }
                .to_string(),
            probe: probe.is_some().then(|| ref_of(gateway_id, COLLECTION_PROBES, name)),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(BackendGroup { pool, settings, probe })
}

/// Drop every sub-resource carrying the listener's name prefix, returning
/// how many entries were removed
fn strip_owned(gateway: &mut ApplicationGateway, listener: &Listener) -> usize {
    let properties = &mut gateway.properties;
    let before = properties.frontend_ports.len()
        + properties.backend_address_pools.len()
        + properties.probes.len()
        + properties.backend_http_settings_collection.len()
        + properties.http_listeners.len()
        + properties.url_path_maps.len()
        + properties.request_routing_rules.len();
    properties.frontend_ports.retain(|entry| !owned_by(listener, entry.name.as_deref()));
    properties.backend_address_pools.retain(|entry| !owned_by(listener, entry.name.as_deref()));
    properties.probes.retain(|entry| !owned_by(listener, entry.name.as_deref()));
    properties
        .backend_http_settings_collection
        .retain(|entry| !owned_by(listener, entry.name.as_deref()));
    properties.http_listeners.retain(|entry| !owned_by(listener, entry.name.as_deref()));
    properties.url_path_maps.retain(|entry| !owned_by(listener, entry.name.as_deref()));
    properties.request_routing_rules.retain(|entry| !owned_by(listener, entry.name.as_deref()));
    let after = properties.frontend_ports.len()
        + properties.backend_address_pools.len()
        + properties.probes.len()
        + properties.backend_http_settings_collection.len()
        + properties.http_listeners.len()
        + properties.url_path_maps.len()
        + properties.request_routing_rules.len();
    before - after
}

fn positive_or(value: i32, fallback: i32) -> i32 {
    if value > 0 { value } else { fallback }
}

fn path_pattern(path: &str) -> String {
    if path.is_empty() {
        "/*".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn ref_of(gateway_id: &str, collection: &str, name: &str) -> SubResource {
    SubResource::new(child_resource_id(gateway_id, collection, name))
}

/// Certificates are referenced either by bare name on this gateway or by a
/// full ARM id
fn certificate_ref(gateway_id: &str, cert_id: &str) -> SubResource {
    if is_resource_id(cert_id) {
        SubResource::new(cert_id.to_string())
    } else {
        SubResource::new(child_resource_id(gateway_id, COLLECTION_SSL_CERTIFICATES, cert_id))
    }
}

fn normalize_health(health: Option<&str>) -> (bool, &'static str) {
    match health {
        Some(BACKEND_SERVER_HEALTHY) => (true, HEALTH_STATUS_HEALTHY),
        Some(BACKEND_SERVER_UNHEALTHY) => (false, HEALTH_STATUS_UNHEALTHY),
        _ => (false, HEALTH_STATUS_UNKNOWN),
    }
}

fn map_backend_health(
    gateway: &ApplicationGateway,
    health: &ApplicationGatewayBackendHealth,
) -> Vec<BackendHealthStatus> {
    let listener_ports = pool_listener_ports(gateway);
    let mut statuses = Vec::new();
    for pool_health in &health.backend_address_pools {
        let pool_name = pool_health.backend_address_pool.as_ref().and_then(|pool| {
            pool.name
                .clone()
                .or_else(|| pool.id.as_deref().map(|id| resource_name(id).to_string()))
        });
        for settings_health in &pool_health.backend_http_settings_collection {
            let (backend_port, protocol) = settings_health
                .backend_http_settings
                .as_ref()
                .map(|settings| {
                    (settings.properties.port, settings.properties.protocol.to_uppercase())
                })
                .unwrap_or((0, String::new()));
            for server in &settings_health.servers {
                let (healthy, status) = normalize_health(server.health.as_deref());
                statuses.push(BackendHealthStatus {
                    ip: server.address.clone().unwrap_or_default(),
                    port: backend_port,
                    protocol: protocol.clone(),
                    listener_port: pool_name
                        .as_deref()
                        .and_then(|name| listener_ports.get(name))
                        .copied()
                        .unwrap_or(0),
                    healthy,
                    status: status.to_string(),
                    target_group_name: pool_name.clone(),
                });
            }
        }
    }
    statuses
}

/// Map each backend pool name to the frontend port routing to it by walking
/// routing rule, HTTP listener and URL path map references
fn pool_listener_ports(gateway: &ApplicationGateway) -> HashMap<String, i32> {
    let frontend_ports: HashMap<&str, i32> = gateway
        .properties
        .frontend_ports
        .iter()
        .filter_map(|entry| entry.name.as_deref().map(|name| (name, entry.properties.port)))
        .collect();
    let listener_ports: HashMap<&str, i32> = gateway
        .properties
        .http_listeners
        .iter()
        .filter_map(|entry| {
            let name = entry.name.as_deref()?;
            let port_name = entry
                .properties
                .frontend_port
                .as_ref()
                .and_then(|port| port.id.as_deref())
                .map(resource_name)?;
            Some((name, *frontend_ports.get(port_name)?))
        })
        .collect();
    let maps_by_name: HashMap<&str, &AppGatewayUrlPathMap> = gateway
        .properties
        .url_path_maps
        .iter()
        .filter_map(|map| map.name.as_deref().map(|name| (name, map)))
        .collect();

    fn record(pool: &Option<SubResource>, port: i32, ports: &mut HashMap<String, i32>) {
        if let Some(id) = pool.as_ref().and_then(|pool| pool.id.as_deref()) {
            ports.insert(resource_name(id).to_string(), port);
        }
    }

    let mut ports = HashMap::new();
    for rule in &gateway.properties.request_routing_rules {
        let Some(port) = rule
            .properties
            .http_listener
            .as_ref()
            .and_then(|entry| entry.id.as_deref())
            .map(resource_name)
            .and_then(|name| listener_ports.get(name).copied())
        else {
            continue;
        };
        record(&rule.properties.backend_address_pool, port, &mut ports);
        let path_map = rule
            .properties
            .url_path_map
            .as_ref()
            .and_then(|entry| entry.id.as_deref())
            .map(resource_name)
            .and_then(|name| maps_by_name.get(name));
        if let Some(map) = path_map {
            record(&map.properties.default_backend_address_pool, port, &mut ports);
            for path_rule in &map.properties.path_rules {
                record(&path_rule.properties.backend_address_pool, port, &mut ports);
            }
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use gantry_api::model::{
        Backend, Certificate, HealthCheck, ListenerRule, ListenerSpec, TargetGroup,
    };

    use super::*;
    use crate::armmodel::{BackendHealthHttpSettings, BackendHealthPool, BackendHealthServer};

    const GATEWAY_ID: &str =
        "/subscriptions/s/resourceGroups/r/providers/Microsoft.Network/applicationGateways/agw-1";

    fn target_group(name: &str, port: i32) -> TargetGroup {
        TargetGroup {
            name: name.to_string(),
            protocol: "HTTP".to_string(),
            backends: vec![
                Backend::new("10.0.0.1".to_string(), port),
                Backend::new("10.0.0.2".to_string(), port),
            ],
        }
    }

    fn http_listener(name: &str, port: i32) -> Listener {
        let spec = ListenerSpec {
            loadbalancer_id: "agw-1".to_string(),
            port,
            protocol: "HTTP".to_string(),
            target_group: Some(target_group("default-tg", 8080)),
            ..Default::default()
        };
        Listener::new(name.to_string(), "default".to_string(), spec)
    }

    fn gateway_with_frontend() -> ApplicationGateway {
        let mut gateway = ApplicationGateway::default();
        gateway.properties.frontend_ip_configurations.push(crate::armmodel::FrontendIpConfiguration {
            id: Some(format!("{GATEWAY_ID}/frontendIPConfigurations/public")),
            name: Some("public".to_string()),
            ..Default::default()
        });
        gateway
    }

    fn names<T>(items: &[T], name_of: fn(&T) -> Option<&str>) -> Vec<String> {
        items.iter().filter_map(|item| name_of(item).map(String::from)).collect()
    }

    #[test]
    fn test_apply_without_rules_routes_basic() {
        let listener = http_listener("web", 80);
        let mut gateway = gateway_with_frontend();

        apply_listener(&mut gateway, &listener, GATEWAY_ID).unwrap();

        assert_eq!(names(&gateway.properties.frontend_ports, |p| p.name.as_deref()), ["web-80"]);
        assert_eq!(
            names(&gateway.properties.backend_address_pools, |p| p.name.as_deref()),
            ["web-80-default"]
        );
        assert_eq!(names(&gateway.properties.http_listeners, |l| l.name.as_deref()), ["web-80"]);
        assert!(gateway.properties.url_path_maps.is_empty());

        let rule = &gateway.properties.request_routing_rules[0].properties;
        assert_eq!(rule.rule_type, RULE_TYPE_BASIC);
        assert_eq!(rule.priority, Some(80));
        assert!(
            rule.backend_address_pool
                .as_ref()
                .and_then(|p| p.id.as_deref())
                .unwrap()
                .ends_with("/backendAddressPools/web-80-default")
        );

        let settings = &gateway.properties.backend_http_settings_collection[0].properties;
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.protocol, "Http");
        assert_eq!(settings.cookie_based_affinity, AFFINITY_DISABLED);
    }

    #[test]
    fn test_apply_with_rules_routes_through_path_map() {
        let mut listener = http_listener("shop", 443);
        listener.spec.protocol = "HTTPS".to_string();
        listener.spec.certificate =
            Some(Certificate { cert_id: "cert-1".to_string(), mode: String::new() });
        listener.spec.rules = vec![
            ListenerRule {
                domain: "a.example.com".to_string(),
                path: "/api".to_string(),
                target_group: Some(target_group("api-tg", 9000)),
                ..Default::default()
            },
            ListenerRule {
                domain: "b.example.com".to_string(),
                path: "/img".to_string(),
                target_group: Some(target_group("img-tg", 9001)),
                ..Default::default()
            },
        ];
        let mut gateway = gateway_with_frontend();

        apply_listener(&mut gateway, &listener, GATEWAY_ID).unwrap();

        // Default group plus one group per rule
        assert_eq!(gateway.properties.backend_address_pools.len(), 3);
        assert_eq!(gateway.properties.backend_http_settings_collection.len(), 3);

        let http = &gateway.properties.http_listeners[0].properties;
        assert_eq!(http.protocol, "Https");
        assert!(
            http.ssl_certificate
                .as_ref()
                .and_then(|c| c.id.as_deref())
                .unwrap()
                .ends_with("/sslCertificates/cert-1")
        );

        let map = &gateway.properties.url_path_maps[0].properties;
        assert_eq!(map.path_rules.len(), 2);
        assert_eq!(map.path_rules[0].properties.paths, ["/api"]);
        assert!(
            map.default_backend_address_pool
                .as_ref()
                .and_then(|p| p.id.as_deref())
                .unwrap()
                .ends_with("/backendAddressPools/shop-443-default")
        );

        let rule = &gateway.properties.request_routing_rules[0].properties;
        assert_eq!(rule.rule_type, RULE_TYPE_PATH_BASED);
        assert_eq!(rule.priority, Some(443));
        assert!(rule.url_path_map.is_some());
        assert!(rule.backend_address_pool.is_none());
    }

    #[test]
    fn test_path_map_default_falls_back_to_first_rule() {
        let mut listener = http_listener("web", 80);
        listener.spec.target_group = None;
        listener.spec.rules = vec![ListenerRule {
            domain: "example.com".to_string(),
            path: "/app".to_string(),
            target_group: Some(target_group("app-tg", 9000)),
            ..Default::default()
        }];
        let mut gateway = gateway_with_frontend();

        apply_listener(&mut gateway, &listener, GATEWAY_ID).unwrap();

        let rule_group = rule_resource_name(&listener, &listener.spec.rules[0]);
        let map = &gateway.properties.url_path_maps[0].properties;
        assert!(
            map.default_backend_address_pool
                .as_ref()
                .and_then(|p| p.id.as_deref())
                .unwrap()
                .ends_with(&format!("/backendAddressPools/{rule_group}"))
        );
        // No resources at all is rejected
        listener.spec.rules.clear();
        assert!(matches!(
            apply_listener(&mut gateway_with_frontend(), &listener, GATEWAY_ID),
            Err(CloudError::Validation(_))
        ));
    }

    #[test]
    fn test_https_requires_certificate() {
        let mut listener = http_listener("web", 443);
        listener.spec.protocol = "HTTPS".to_string();
        let mut gateway = gateway_with_frontend();
        assert!(matches!(
            apply_listener(&mut gateway, &listener, GATEWAY_ID),
            Err(CloudError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_path_patterns_collapse() {
        let mut listener = http_listener("web", 80);
        listener.spec.rules = vec![
            ListenerRule {
                domain: "a.example.com".to_string(),
                path: "/api".to_string(),
                target_group: Some(target_group("a-tg", 9000)),
                ..Default::default()
            },
            ListenerRule {
                domain: "b.example.com".to_string(),
                path: "/api".to_string(),
                target_group: Some(target_group("b-tg", 9001)),
                ..Default::default()
            },
        ];
        let mut gateway = gateway_with_frontend();

        apply_listener(&mut gateway, &listener, GATEWAY_ID).unwrap();
        assert_eq!(gateway.properties.url_path_maps[0].properties.path_rules.len(), 1);
    }

    #[test]
    fn test_reapply_prunes_stale_and_keeps_foreign() {
        let mut gateway = gateway_with_frontend();
        apply_listener(&mut gateway, &http_listener("api", 9000), GATEWAY_ID).unwrap();
        apply_listener(&mut gateway, &http_listener("web", 80), GATEWAY_ID).unwrap();

        // web moves to port 8080: its old entries vanish, api stays
        apply_listener(&mut gateway, &http_listener("web", 8080), GATEWAY_ID).unwrap();

        let ports = names(&gateway.properties.frontend_ports, |p| p.name.as_deref());
        assert!(ports.contains(&"api-9000".to_string()));
        assert!(ports.contains(&"web-8080".to_string()));
        assert!(!ports.contains(&"web-80".to_string()));

        let web = http_listener("web", 8080);
        assert!(strip_owned(&mut gateway, &web) > 0);
        assert_eq!(
            names(&gateway.properties.http_listeners, |l| l.name.as_deref()),
            ["api-9000"]
        );
    }

    #[test]
    fn test_probe_follows_health_check() {
        let mut tg = target_group("api-tg", 9000);
        tg.protocol = "HTTPS".to_string();
        let attribute = ListenerAttribute {
            session_time: 600,
            health_check: Some(HealthCheck {
                enabled: true,
                interval_time: 10,
                timeout: 5,
                unhealthy_threshold: 4,
                http_code: Some("200-399,404".to_string()),
                http_check_path: "/healthz".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let group = build_backend_group(
            "web-abc12345",
            &tg,
            Some(&attribute),
            Some("example.com"),
            GATEWAY_ID,
        )
        .unwrap();

        let probe = group.probe.unwrap();
        assert_eq!(probe.properties.protocol, "Https");
        assert_eq!(probe.properties.path, "/healthz");
        assert_eq!(probe.properties.interval, 10);
        assert_eq!(probe.properties.timeout, 5);
        assert_eq!(probe.properties.unhealthy_threshold, 4);
        assert_eq!(probe.properties.host.as_deref(), Some("example.com"));
        assert_eq!(
            probe.properties.r#match.unwrap().status_codes,
            ["200-399", "404"]
        );

        assert_eq!(group.settings.properties.cookie_based_affinity, AFFINITY_ENABLED);
        assert!(group.settings.properties.probe.is_some());

        // Mixed backend ports cannot sit behind one settings entry
        let mut mixed = target_group("bad-tg", 9000);
        mixed.backends[1].port = 9001;
        assert!(build_backend_group("x", &mixed, None, None, GATEWAY_ID).is_err());
    }

    #[test]
    fn test_map_backend_health_resolves_listener_ports() {
        let listener = http_listener("web", 443);
        let mut gateway = gateway_with_frontend();
        apply_listener(&mut gateway, &listener, GATEWAY_ID).unwrap();

        let health = ApplicationGatewayBackendHealth {
            backend_address_pools: vec![BackendHealthPool {
                backend_address_pool: Some(AppGatewayBackendPool {
                    id: Some(format!("{GATEWAY_ID}/backendAddressPools/web-443-default")),
                    ..Default::default()
                }),
                backend_http_settings_collection: vec![BackendHealthHttpSettings {
                    backend_http_settings: Some(AppGatewayBackendHttpSettings {
                        name: Some("web-443-default".to_string()),
                        properties: AppGatewayBackendHttpSettingsProperties {
                            port: 8080,
                            protocol: "Http".to_string(),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                    servers: vec![
                        BackendHealthServer {
                            address: Some("10.0.0.1".to_string()),
                            health: Some("Healthy".to_string()),
                            ..Default::default()
                        },
                        BackendHealthServer {
                            address: Some("10.0.0.2".to_string()),
                            health: Some("Unhealthy".to_string()),
                            ..Default::default()
                        },
                        BackendHealthServer {
                            address: Some("10.0.0.3".to_string()),
                            health: None,
                            ..Default::default()
                        },
                    ],
                }],
            }],
        };

        let statuses = map_backend_health(&gateway, &health);
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.listener_port == 443));
        assert!(statuses.iter().all(|s| s.port == 8080));
        assert!(statuses[0].healthy);
        assert_eq!(statuses[0].status, HEALTH_STATUS_HEALTHY);
        assert!(!statuses[1].healthy);
        assert_eq!(statuses[1].status, HEALTH_STATUS_UNHEALTHY);
        assert_eq!(statuses[2].status, HEALTH_STATUS_UNKNOWN);
        assert_eq!(statuses[0].target_group_name.as_deref(), Some("web-443-default"));
    }
}
