//! Layer-7 listeners on the global HTTP(S) load balancer
//!
//! A listener materializes as a chain of global resources all named
//! `{listener}-{port}`: a forwarding rule on the frontend port, a target
//! HTTP(S) proxy, and a URL map routing to backend services. Each routing
//! target becomes one backend service plus its health check:
//! `{base}-default` for the listener-level target group and
//! `{listener}-{hash}` per rule. Backend services point at one zonal NEG
//! per zone holding the pod endpoints of that zone.
//!
//! Certificates are referenced by name or link and must already exist in
//! the project; the reconciler never uploads certificate material.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use gantry_api::model::{
    BackendHealthStatus, HEALTH_STATUS_HEALTHY, HEALTH_STATUS_UNHEALTHY, HEALTH_STATUS_UNKNOWN,
    Listener, ListenerAttribute, PROTOCOL_HTTPS, PROTOCOL_TCP, TargetGroup,
};
use gantry_common::error::{CloudError, Result};

use crate::client::ComputeClient;
use crate::link::{
    default_group_name, is_ip_address, is_self_link, listener_resource_name, matcher_name,
    neg_name, resource_name, rule_group_name, zone_of,
};
use crate::model::{
    Backend, BackendService, ForwardingRule, HEALTH_STATE_HEALTHY, HEALTH_STATE_UNHEALTHY,
    HealthCheck, HostRule, HttpHealthCheck, PathMatcher, PathRule, TargetHttpProxy,
    TargetHttpsProxy, UrlMap,
};
use crate::{neg, topology};

const SCHEME_EXTERNAL: &str = "EXTERNAL";
const BALANCING_MODE_RATE: &str = "RATE";
const DEFAULT_MAX_RATE_PER_ENDPOINT: f64 = 100.0;
const SESSION_AFFINITY_GENERATED_COOKIE: &str = "GENERATED_COOKIE";

const CHECK_TYPE_HTTP: &str = "HTTP";
const CHECK_TYPE_HTTPS: &str = "HTTPS";
/// Health checks hit the port each endpoint serves on
const PORT_SPECIFICATION_SERVING: &str = "USE_SERVING_PORT";

pub(crate) const DEFAULT_CHECK_INTERVAL: i32 = 5;
pub(crate) const DEFAULT_CHECK_TIMEOUT: i32 = 5;
const DEFAULT_HEALTHY_THRESHOLD: i32 = 2;
const DEFAULT_UNHEALTHY_THRESHOLD: i32 = 2;

/// Converge the whole resource chain of this listener. Returns the link
/// of the global forwarding rule.
pub(crate) async fn ensure(
    client: &ComputeClient,
    kube: &kube::Client,
    listener: &Listener,
) -> Result<String> {
    let base = listener_resource_name(listener);
    let (groups, routes, default_group) = collect_groups(listener)?;

    for group in &groups {
        ensure_backend_group(client, kube, listener, group).await?;
    }

    let map = build_url_map(&base, &routes, &default_group, |name| {
        client.global_link("backendServices", name)
    });
    converge_url_map(client, map).await?;

    let map_link = client.global_link("urlMaps", &base);
    let target = ensure_target_proxy(client, listener, &base, &map_link).await?;
    ensure_forwarding_rule(client, listener, &base, &target).await?;

    info!(
        listener = %listener.key(),
        forwarding_rule = %base,
        port = listener.spec.port,
        rules = routes.len(),
        "ensured layer-7 listener"
    );
    Ok(client.global_link("forwardingRules", &base))
}

/// Tear the chain down frontend first, so nothing references a resource
/// while it is deleted. Every stage tolerates being gone already.
pub(crate) async fn delete(client: &ComputeClient, listener: &Listener) -> Result<()> {
    let base = listener_resource_name(listener);
    client.delete_forwarding_rule(&base).await?;
    // The proxy type follows the protocol; a flipped protocol leaves the
    // other type behind, so clear both
    client.delete_target_https_proxy(&base).await?;
    client.delete_target_http_proxy(&base).await?;
    client.delete_url_map(&base).await?;

    let mut seen = HashSet::new();
    let mut names = vec![default_group_name(listener)];
    names.extend(listener.spec.rules.iter().map(|rule| rule_group_name(listener, rule)));
    for name in names {
        if seen.insert(name.clone()) {
            delete_backend_group(client, &name).await?;
        }
    }
    info!(listener = %listener.key(), forwarding_rule = %base, "deleted layer-7 listener");
    Ok(())
}

/// Backend health of every service reachable from one forwarding rule,
/// resolved by walking proxy, URL map and backend services
pub(crate) async fn backend_status(
    client: &ComputeClient,
    lb_id: &str,
) -> Result<Vec<BackendHealthStatus>> {
    let Some(rule) = client.get_forwarding_rule(resource_name(lb_id)).await? else {
        return Ok(Vec::new());
    };
    let listener_port = rule.frontend_port();
    let Some(map_link) = proxy_url_map(client, &rule.target).await? else {
        return Ok(Vec::new());
    };
    let Some(map) = client.get_url_map(resource_name(&map_link)).await? else {
        return Ok(Vec::new());
    };

    let mut statuses = Vec::new();
    for service_link in collect_services(&map) {
        let name = resource_name(&service_link).to_string();
        let Some(service) = client.get_backend_service(&name).await? else {
            continue;
        };
        for backend in &service.backends {
            let health = client.backend_service_health(&name, &backend.group).await?;
            for endpoint in health.health_status {
                let (healthy, status) = normalize_health(&endpoint.health_state);
                statuses.push(BackendHealthStatus {
                    ip: endpoint.ip_address,
                    port: endpoint.port,
                    protocol: service.protocol.to_uppercase(),
                    listener_port,
                    healthy,
                    status: status.to_string(),
                    target_group_name: Some(service.name.clone()),
                });
            }
        }
    }
    Ok(statuses)
}

/// One backend service to converge, with the attribute and probe host
/// that apply to it
struct BackendGroup<'a> {
    name: String,
    target_group: &'a TargetGroup,
    attribute: Option<&'a ListenerAttribute>,
    host: Option<&'a str>,
}

/// One URL map route, pointing at a backend group by name
struct RouteTarget<'a> {
    domain: &'a str,
    path: &'a str,
    group: String,
}

/// Backend groups and routes of a listener. The default service falls
/// back to the first rule's group when the listener has no top-level
/// target group.
fn collect_groups(
    listener: &Listener,
) -> Result<(Vec<BackendGroup<'_>>, Vec<RouteTarget<'_>>, String)> {
    let attribute = listener.spec.listener_attribute.as_ref();
    let mut groups = Vec::new();
    let mut routes = Vec::new();

    if let Some(target_group) = listener.spec.target_group.as_ref() {
        groups.push(BackendGroup {
            name: default_group_name(listener),
            target_group,
            attribute,
            host: None,
        });
    }

    let mut seen: HashSet<String> = HashSet::new();
    for rule in &listener.spec.rules {
        let Some(target_group) = rule.target_group.as_ref() else {
            return Err(CloudError::Validation(format!(
                "rule '{}' of listener '{}' has no target group",
                rule.key(),
                listener.key()
            )));
        };
        // Domain and path pairs must be unique within one URL map
        if !seen.insert(rule.key()) {
            warn!(
                listener = %listener.key(),
                rule = %rule.key(),
                "skipping rule, domain and path already routed"
            );
            continue;
        }
        let name = rule_group_name(listener, rule);
        groups.push(BackendGroup {
            name: name.clone(),
            target_group,
            attribute: rule.listener_attribute.as_ref().or(attribute),
            host: (!rule.domain.is_empty()).then_some(rule.domain.as_str()),
        });
        routes.push(RouteTarget { domain: &rule.domain, path: &rule.path, group: name });
    }

    let default_group = match groups.first() {
        Some(group) => group.name.clone(),
        None => {
            return Err(CloudError::Validation(format!(
                "listener '{}' needs a target group or at least one rule",
                listener.key()
            )));
        }
    };
    Ok((groups, routes, default_group))
}

/// Converge one backend service: health check, one NEG per zone carrying
/// the group's endpoints, then the service referencing them
async fn ensure_backend_group(
    client: &ComputeClient,
    kube: &kube::Client,
    listener: &Listener,
    group: &BackendGroup<'_>,
) -> Result<()> {
    let health_link = ensure_health_check(client, group).await?;

    let by_zone =
        topology::resolve_backends(kube, client, &listener.namespace, group.target_group).await?;
    let mut zones: Vec<&String> = by_zone.keys().collect();
    zones.sort();

    let mut backends = Vec::new();
    for zone in zones {
        let endpoints = &by_zone[zone];
        let Some(first) = endpoints.first() else { continue };
        let link = neg::ensure_group_endpoints(
            client,
            &neg_name(&group.name, zone),
            zone,
            &first.network,
            &first.subnetwork,
            endpoints,
        )
        .await?;
        backends.push(Backend {
            group: link,
            balancing_mode: Some(BALANCING_MODE_RATE.to_string()),
            max_rate_per_endpoint: Some(DEFAULT_MAX_RATE_PER_ENDPOINT),
        });
    }

    let desired = build_backend_service(group, backends, health_link);
    match client.get_backend_service(&group.name).await? {
        Some(existing) => {
            let stale = stale_group_links(&existing, &desired);
            if backend_service_changed(&existing, &desired) {
                let mut updated = desired;
                updated.fingerprint = existing.fingerprint.clone();
                updated.extra = existing.extra.clone();
                client.update_backend_service(&updated).await?;
            }
            // NEGs of zones no endpoint lives in anymore
            for link in stale {
                if let Some(zone) = zone_of(&link) {
                    client.delete_network_endpoint_group(zone, resource_name(&link)).await?;
                }
            }
        }
        None => client.insert_backend_service(&desired).await?,
    }
    Ok(())
}

async fn ensure_health_check(client: &ComputeClient, group: &BackendGroup<'_>) -> Result<String> {
    let desired = build_health_check(group);
    match client.get_health_check(&group.name).await? {
        Some(existing) => {
            if health_check_changed(&existing, &desired) {
                client.update_health_check(&desired).await?;
            }
        }
        None => client.insert_health_check(&desired).await?,
    }
    Ok(client.global_link("healthChecks", &group.name))
}

/// Drop one backend group with the zonal NEGs the live service references
async fn delete_backend_group(client: &ComputeClient, name: &str) -> Result<()> {
    let negs: Vec<(String, String)> = match client.get_backend_service(name).await? {
        Some(existing) => existing
            .backends
            .iter()
            .filter_map(|backend| {
                let zone = zone_of(&backend.group)?.to_string();
                Some((zone, resource_name(&backend.group).to_string()))
            })
            .collect(),
        None => Vec::new(),
    };
    client.delete_backend_service(name).await?;
    for (zone, neg) in negs {
        client.delete_network_endpoint_group(&zone, &neg).await?;
    }
    client.delete_health_check(name).await?;
    Ok(())
}

fn build_health_check(group: &BackendGroup<'_>) -> HealthCheck {
    let spec_check = group
        .attribute
        .and_then(|attribute| attribute.health_check.as_ref())
        .filter(|check| check.enabled);
    let http_check = HttpHealthCheck {
        port_specification: Some(PORT_SPECIFICATION_SERVING.to_string()),
        request_path: spec_check
            .map(|check| check.http_check_path.as_str())
            .filter(|path| !path.is_empty())
            .unwrap_or("/")
            .to_string(),
        host: group.host.unwrap_or_default().to_string(),
        ..Default::default()
    };

    let is_https = group.target_group.protocol.to_uppercase() == PROTOCOL_HTTPS;
    HealthCheck {
        name: group.name.clone(),
        check_type: if is_https { CHECK_TYPE_HTTPS } else { CHECK_TYPE_HTTP }.to_string(),
        check_interval_sec: positive_or(
            spec_check.map(|check| check.interval_time).unwrap_or(0),
            DEFAULT_CHECK_INTERVAL,
        ),
        timeout_sec: positive_or(
            spec_check.map(|check| check.timeout).unwrap_or(0),
            DEFAULT_CHECK_TIMEOUT,
        ),
        healthy_threshold: positive_or(
            spec_check.map(|check| check.healthy_threshold).unwrap_or(0),
            DEFAULT_HEALTHY_THRESHOLD,
        ),
        unhealthy_threshold: positive_or(
            spec_check.map(|check| check.unhealthy_threshold).unwrap_or(0),
            DEFAULT_UNHEALTHY_THRESHOLD,
        ),
        http_health_check: (!is_https).then(|| http_check.clone()),
        https_health_check: is_https.then_some(http_check),
        ..Default::default()
    }
}

fn health_check_changed(existing: &HealthCheck, desired: &HealthCheck) -> bool {
    fn http_shape(check: &HealthCheck) -> Option<(&str, &str)> {
        check
            .http_health_check
            .as_ref()
            .or(check.https_health_check.as_ref())
            .map(|http| (http.request_path.as_str(), http.host.as_str()))
    }
    existing.check_type != desired.check_type
        || existing.check_interval_sec != desired.check_interval_sec
        || existing.timeout_sec != desired.timeout_sec
        || existing.healthy_threshold != desired.healthy_threshold
        || existing.unhealthy_threshold != desired.unhealthy_threshold
        || http_shape(existing) != http_shape(desired)
}

fn build_backend_service(
    group: &BackendGroup<'_>,
    backends: Vec<Backend>,
    health_check: String,
) -> BackendService {
    let session_time = group.attribute.map(|attribute| attribute.session_time).unwrap_or(0);
    BackendService {
        name: group.name.clone(),
        protocol: service_protocol(&group.target_group.protocol),
        load_balancing_scheme: SCHEME_EXTERNAL.to_string(),
        backends,
        health_checks: vec![health_check],
        session_affinity: (session_time > 0)
            .then(|| SESSION_AFFINITY_GENERATED_COOKIE.to_string()),
        affinity_cookie_ttl_sec: (session_time > 0).then_some(session_time),
        ..Default::default()
    }
}

fn backend_service_changed(existing: &BackendService, desired: &BackendService) -> bool {
    let existing_groups: HashSet<&str> =
        existing.backends.iter().map(|backend| backend.group.as_str()).collect();
    let desired_groups: HashSet<&str> =
        desired.backends.iter().map(|backend| backend.group.as_str()).collect();
    existing_groups != desired_groups
        || existing.health_checks != desired.health_checks
        || existing.protocol != desired.protocol
        || existing.session_affinity != desired.session_affinity
        || existing.affinity_cookie_ttl_sec != desired.affinity_cookie_ttl_sec
}

/// Backend group links the live service carries but the desired one does not
fn stale_group_links(existing: &BackendService, desired: &BackendService) -> Vec<String> {
    let desired_groups: HashSet<&str> =
        desired.backends.iter().map(|backend| backend.group.as_str()).collect();
    existing
        .backends
        .iter()
        .map(|backend| backend.group.clone())
        .filter(|group| !desired_groups.contains(group.as_str()))
        .collect()
}

/// The load balancer only speaks HTTP(S) toward backends
fn service_protocol(protocol: &str) -> String {
    if protocol.to_uppercase() == PROTOCOL_HTTPS { PROTOCOL_HTTPS } else { "HTTP" }.to_string()
}

fn build_url_map(
    base: &str,
    routes: &[RouteTarget<'_>],
    default_group: &str,
    link_of: impl Fn(&str) -> String,
) -> UrlMap {
    let default_service = link_of(default_group);

    let mut domains: Vec<&str> = Vec::new();
    let mut by_domain: HashMap<&str, Vec<&RouteTarget>> = HashMap::new();
    for route in routes {
        if !by_domain.contains_key(route.domain) {
            domains.push(route.domain);
        }
        by_domain.entry(route.domain).or_default().push(route);
    }

    let mut host_rules = Vec::new();
    let mut path_matchers = Vec::new();
    for domain in domains {
        let matcher = matcher_name(base, domain);
        host_rules.push(HostRule {
            hosts: vec![if domain.is_empty() { "*" } else { domain }.to_string()],
            path_matcher: matcher.clone(),
        });
        path_matchers.push(PathMatcher {
            name: matcher,
            default_service: default_service.clone(),
            path_rules: by_domain[domain]
                .iter()
                .map(|route| PathRule {
                    paths: vec![path_pattern(route.path)],
                    service: link_of(&route.group),
                })
                .collect(),
        });
    }

    UrlMap {
        name: base.to_string(),
        default_service,
        host_rules,
        path_matchers,
        ..Default::default()
    }
}

async fn converge_url_map(client: &ComputeClient, desired: UrlMap) -> Result<()> {
    match client.get_url_map(&desired.name).await? {
        Some(existing) => {
            if url_map_changed(&existing, &desired) {
                let mut updated = desired;
                updated.fingerprint = existing.fingerprint.clone();
                updated.extra = existing.extra.clone();
                client.update_url_map(&updated).await?;
            }
        }
        None => client.insert_url_map(&desired).await?,
    }
    Ok(())
}

/// Order-insensitive comparison of the routing shape
fn url_map_changed(existing: &UrlMap, desired: &UrlMap) -> bool {
    type Shape = (String, Vec<(Vec<String>, String)>, Vec<(String, String, Vec<(Vec<String>, String)>)>);
    fn shape(map: &UrlMap) -> Shape {
        let mut hosts: Vec<(Vec<String>, String)> = map
            .host_rules
            .iter()
            .map(|rule| {
                let mut hosts = rule.hosts.clone();
                hosts.sort();
                (hosts, rule.path_matcher.clone())
            })
            .collect();
        hosts.sort();
        let mut matchers: Vec<(String, String, Vec<(Vec<String>, String)>)> = map
            .path_matchers
            .iter()
            .map(|matcher| {
                let mut rules: Vec<(Vec<String>, String)> = matcher
                    .path_rules
                    .iter()
                    .map(|rule| {
                        let mut paths = rule.paths.clone();
                        paths.sort();
                        (paths, rule.service.clone())
                    })
                    .collect();
                rules.sort();
                (matcher.name.clone(), matcher.default_service.clone(), rules)
            })
            .collect();
        matchers.sort();
        (map.default_service.clone(), hosts, matchers)
    }
    shape(existing) != shape(desired)
}

async fn ensure_target_proxy(
    client: &ComputeClient,
    listener: &Listener,
    base: &str,
    url_map: &str,
) -> Result<String> {
    if is_https(listener) {
        let certificates = vec![certificate_link(client, listener)?];
        match client.get_target_https_proxy(base).await? {
            Some(existing) => {
                if resource_name(&existing.url_map) != resource_name(url_map) {
                    client.set_target_https_proxy_url_map(base, url_map).await?;
                }
                if !same_resources(&existing.ssl_certificates, &certificates) {
                    client.set_target_https_proxy_certificates(base, certificates).await?;
                }
            }
            None => {
                client
                    .insert_target_https_proxy(&TargetHttpsProxy {
                        name: base.to_string(),
                        url_map: url_map.to_string(),
                        ssl_certificates: certificates,
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(client.global_link("targetHttpsProxies", base))
    } else {
        match client.get_target_http_proxy(base).await? {
            Some(existing) => {
                if resource_name(&existing.url_map) != resource_name(url_map) {
                    client.set_target_http_proxy_url_map(base, url_map).await?;
                }
            }
            None => {
                client
                    .insert_target_http_proxy(&TargetHttpProxy {
                        name: base.to_string(),
                        url_map: url_map.to_string(),
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(client.global_link("targetHttpProxies", base))
    }
}

async fn ensure_forwarding_rule(
    client: &ComputeClient,
    listener: &Listener,
    base: &str,
    target: &str,
) -> Result<()> {
    let desired =
        build_forwarding_rule(base, listener.spec.port, target, frontend_address(client, listener));
    match client.get_forwarding_rule(base).await? {
        Some(existing) => {
            // The frontend address is immutable; moving it means recreating
            // the rule
            if address_changed(&existing, &desired) {
                client.delete_forwarding_rule(base).await?;
                client.insert_forwarding_rule(&desired).await?;
            } else if resource_name(&existing.target) != resource_name(target) {
                client.set_forwarding_rule_target(base, target).await?;
            }
        }
        None => client.insert_forwarding_rule(&desired).await?,
    }
    Ok(())
}

fn build_forwarding_rule(
    base: &str,
    port: i32,
    target: &str,
    address: Option<String>,
) -> ForwardingRule {
    ForwardingRule {
        name: base.to_string(),
        ip_address: address,
        ip_protocol: PROTOCOL_TCP.to_string(),
        port_range: format!("{port}-{port}"),
        target: target.to_string(),
        load_balancing_scheme: SCHEME_EXTERNAL.to_string(),
        self_link: None,
    }
}

/// Frontend pin of a listener: a literal address, a link, or the link of
/// a reserved global address named by the loadbalancer id. Empty means
/// the API assigns an ephemeral address.
fn frontend_address(client: &ComputeClient, listener: &Listener) -> Option<String> {
    let lb_id = listener.spec.loadbalancer_id.trim();
    if lb_id.is_empty() {
        return None;
    }
    if is_ip_address(lb_id) || is_self_link(lb_id) {
        return Some(lb_id.to_string());
    }
    Some(client.global_link("addresses", lb_id))
}

/// The API echoes a literal address even for rules created from an
/// address link, so only literal pins are comparable
fn address_changed(existing: &ForwardingRule, desired: &ForwardingRule) -> bool {
    match desired.ip_address.as_deref() {
        Some(address) if is_ip_address(address) => {
            existing.ip_address.as_deref() != Some(address)
        }
        _ => false,
    }
}

fn is_https(listener: &Listener) -> bool {
    listener.spec.protocol.to_uppercase() == PROTOCOL_HTTPS
}

/// Certificate id of an HTTPS listener; its absence is a validation error
fn certificate_id(listener: &Listener) -> Result<&str> {
    listener
        .spec
        .certificate
        .as_ref()
        .map(|certificate| certificate.cert_id.as_str())
        .filter(|cert_id| !cert_id.is_empty())
        .ok_or_else(|| {
            CloudError::Validation(format!(
                "HTTPS listener '{}' needs a certificate",
                listener.key()
            ))
        })
}

fn certificate_link(client: &ComputeClient, listener: &Listener) -> Result<String> {
    let cert_id = certificate_id(listener)?;
    Ok(if is_self_link(cert_id) {
        cert_id.to_string()
    } else {
        client.global_link("sslCertificates", cert_id)
    })
}

fn same_resources(left: &[String], right: &[String]) -> bool {
    let left: HashSet<&str> = left.iter().map(|link| resource_name(link)).collect();
    let right: HashSet<&str> = right.iter().map(|link| resource_name(link)).collect();
    left == right
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

fn positive_or(value: i32, fallback: i32) -> i32 {
    if value > 0 { value } else { fallback }
}

async fn proxy_url_map(client: &ComputeClient, target: &str) -> Result<Option<String>> {
    let name = resource_name(target);
    if target.contains("/targetHttpsProxies/") {
        Ok(client.get_target_https_proxy(name).await?.map(|proxy| proxy.url_map))
    } else {
        Ok(client.get_target_http_proxy(name).await?.map(|proxy| proxy.url_map))
    }
}

/// Every backend service link a URL map routes to
fn collect_services(map: &UrlMap) -> Vec<String> {
    let mut services = vec![map.default_service.clone()];
    for matcher in &map.path_matchers {
        services.push(matcher.default_service.clone());
        for rule in &matcher.path_rules {
            services.push(rule.service.clone());
        }
    }
    services.sort();
    services.dedup();
    services.retain(|service| !service.is_empty());
    services
}

fn normalize_health(state: &str) -> (bool, &'static str) {
    match state {
        HEALTH_STATE_HEALTHY => (true, HEALTH_STATUS_HEALTHY),
        HEALTH_STATE_UNHEALTHY => (false, HEALTH_STATUS_UNHEALTHY),
        _ => (false, HEALTH_STATUS_UNKNOWN),
    }
}

#[cfg(test)]
mod tests {
    use gantry_api::model::{
        Backend as ApiBackend, Certificate, HealthCheck as SpecHealthCheck, ListenerRule,
        ListenerSpec,
    };

    use super::*;

    fn target_group(name: &str, port: i32) -> TargetGroup {
        TargetGroup {
            name: name.to_string(),
            protocol: "HTTP".to_string(),
            backends: vec![
                ApiBackend::new("10.8.0.4".to_string(), port),
                ApiBackend::new("10.8.0.5".to_string(), port),
            ],
        }
    }

    fn http_listener(name: &str, port: i32) -> Listener {
        let spec = ListenerSpec {
            loadbalancer_id: String::new(),
            port,
            protocol: "HTTP".to_string(),
            target_group: Some(target_group("default-tg", 8080)),
            ..Default::default()
        };
        Listener::new(name.to_string(), "prod".to_string(), spec)
    }

    fn rule(domain: &str, path: &str, port: i32) -> ListenerRule {
        ListenerRule {
            domain: domain.to_string(),
            path: path.to_string(),
            target_group: Some(target_group("rule-tg", port)),
            ..Default::default()
        }
    }

    fn test_link(name: &str) -> String {
        format!("https://www.googleapis.com/compute/v1/projects/p/global/backendServices/{name}")
    }

    #[test]
    fn test_collect_groups_default_and_rules() {
        let mut listener = http_listener("web", 443);
        listener.spec.rules =
            vec![rule("a.example.com", "/api", 9000), rule("b.example.com", "/img", 9001)];

        let (groups, routes, default_group) = collect_groups(&listener).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].name, "web-443-default");
        assert_eq!(default_group, "web-443-default");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].domain, "a.example.com");
        assert_eq!(routes[0].group, groups[1].name);
        assert_eq!(groups[1].host, Some("a.example.com"));
        // Default group probes without a host
        assert!(groups[0].host.is_none());
    }

    #[test]
    fn test_collect_groups_duplicate_route_collapses() {
        let mut listener = http_listener("web", 443);
        listener.spec.rules =
            vec![rule("a.example.com", "/api", 9000), rule("a.example.com", "/api", 9001)];

        let (groups, routes, _) = collect_groups(&listener).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn test_collect_groups_fallback_and_rejection() {
        let mut listener = http_listener("web", 443);
        listener.spec.target_group = None;
        listener.spec.rules = vec![rule("a.example.com", "/api", 9000)];
        let (_, _, default_group) = collect_groups(&listener).unwrap();
        assert_eq!(default_group, rule_group_name(&listener, &listener.spec.rules[0]));

        listener.spec.rules.clear();
        assert!(matches!(collect_groups(&listener), Err(CloudError::Validation(_))));

        let mut bare_rule = http_listener("web", 443);
        bare_rule.spec.rules = vec![ListenerRule {
            domain: "a.example.com".to_string(),
            ..Default::default()
        }];
        assert!(matches!(collect_groups(&bare_rule), Err(CloudError::Validation(_))));
    }

    #[test]
    fn test_health_check_follows_spec_values() {
        let attribute = ListenerAttribute {
            health_check: Some(SpecHealthCheck {
                enabled: true,
                interval_time: 10,
                timeout: 3,
                healthy_threshold: 4,
                unhealthy_threshold: 5,
                http_check_path: "/healthz".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut tg = target_group("api-tg", 9000);
        tg.protocol = "HTTPS".to_string();
        let group = BackendGroup {
            name: "web-abc12345".to_string(),
            target_group: &tg,
            attribute: Some(&attribute),
            host: Some("example.com"),
        };

        let check = build_health_check(&group);
        assert_eq!(check.check_type, "HTTPS");
        assert_eq!(check.check_interval_sec, 10);
        assert_eq!(check.timeout_sec, 3);
        assert_eq!(check.healthy_threshold, 4);
        assert_eq!(check.unhealthy_threshold, 5);
        assert!(check.http_health_check.is_none());
        let http = check.https_health_check.unwrap();
        assert_eq!(http.request_path, "/healthz");
        assert_eq!(http.host, "example.com");
        assert_eq!(http.port_specification.as_deref(), Some("USE_SERVING_PORT"));
    }

    #[test]
    fn test_health_check_defaults_without_spec() {
        let tg = target_group("web-tg", 8080);
        let group = BackendGroup {
            name: "web-443-default".to_string(),
            target_group: &tg,
            attribute: None,
            host: None,
        };

        let check = build_health_check(&group);
        assert_eq!(check.check_type, "HTTP");
        assert_eq!(check.check_interval_sec, DEFAULT_CHECK_INTERVAL);
        assert_eq!(check.timeout_sec, DEFAULT_CHECK_TIMEOUT);
        let http = check.http_health_check.unwrap();
        assert_eq!(http.request_path, "/");
        assert!(http.host.is_empty());
    }

    #[test]
    fn test_backend_service_affinity() {
        let attribute = ListenerAttribute { session_time: 600, ..Default::default() };
        let tg = target_group("web-tg", 8080);
        let group = BackendGroup {
            name: "web-443-default".to_string(),
            target_group: &tg,
            attribute: Some(&attribute),
            host: None,
        };

        let service = build_backend_service(&group, Vec::new(), test_link("hc"));
        assert_eq!(service.session_affinity.as_deref(), Some("GENERATED_COOKIE"));
        assert_eq!(service.affinity_cookie_ttl_sec, Some(600));
        assert_eq!(service.load_balancing_scheme, "EXTERNAL");

        let plain = BackendGroup { attribute: None, ..group };
        let service = build_backend_service(&plain, Vec::new(), test_link("hc"));
        assert!(service.session_affinity.is_none());
        assert!(service.affinity_cookie_ttl_sec.is_none());
    }

    #[test]
    fn test_backend_service_change_and_stale_links() {
        let tg = target_group("web-tg", 8080);
        let group = BackendGroup {
            name: "web-443-default".to_string(),
            target_group: &tg,
            attribute: None,
            host: None,
        };
        let backend = |zone: &str| Backend {
            group: format!("projects/p/zones/{zone}/networkEndpointGroups/web-443-default"),
            balancing_mode: Some(BALANCING_MODE_RATE.to_string()),
            max_rate_per_endpoint: Some(DEFAULT_MAX_RATE_PER_ENDPOINT),
        };

        let existing = build_backend_service(
            &group,
            vec![backend("us-east1-b"), backend("us-east1-c")],
            test_link("hc"),
        );
        let desired =
            build_backend_service(&group, vec![backend("us-east1-c"), backend("us-east1-b")], test_link("hc"));
        assert!(!backend_service_changed(&existing, &desired));
        assert!(stale_group_links(&existing, &desired).is_empty());

        let shrunk = build_backend_service(&group, vec![backend("us-east1-b")], test_link("hc"));
        assert!(backend_service_changed(&existing, &shrunk));
        let stale = stale_group_links(&existing, &shrunk);
        assert_eq!(stale.len(), 1);
        assert!(stale[0].ends_with("/zones/us-east1-c/networkEndpointGroups/web-443-default"));
    }

    #[test]
    fn test_url_map_shape() {
        let mut listener = http_listener("web", 443);
        listener.spec.rules = vec![
            rule("a.example.com", "/api", 9000),
            rule("a.example.com", "img", 9001),
            rule("", "/fallback", 9002),
        ];
        let (_, routes, default_group) = collect_groups(&listener).unwrap();

        let map = build_url_map("web-443", &routes, &default_group, |name| test_link(name));
        assert_eq!(map.name, "web-443");
        assert_eq!(map.default_service, test_link("web-443-default"));
        assert_eq!(map.host_rules.len(), 2);
        assert_eq!(map.host_rules[0].hosts, ["a.example.com"]);
        assert_eq!(map.host_rules[1].hosts, ["*"]);
        assert_eq!(map.path_matchers.len(), 2);
        let first = &map.path_matchers[0];
        assert_eq!(first.default_service, map.default_service);
        assert_eq!(first.path_rules.len(), 2);
        assert_eq!(first.path_rules[0].paths, ["/api"]);
        // Bare paths gain a leading slash
        assert_eq!(first.path_rules[1].paths, ["/img"]);
    }

    #[test]
    fn test_url_map_comparison_ignores_order() {
        let mut listener = http_listener("web", 443);
        listener.spec.rules =
            vec![rule("a.example.com", "/api", 9000), rule("b.example.com", "/img", 9001)];
        let (_, routes, default_group) = collect_groups(&listener).unwrap();

        let desired = build_url_map("web-443", &routes, &default_group, |name| test_link(name));
        let mut live = desired.clone();
        live.host_rules.reverse();
        live.path_matchers.reverse();
        assert!(!url_map_changed(&live, &desired));

        live.path_matchers[0].path_rules[0].service = test_link("elsewhere");
        assert!(url_map_changed(&live, &desired));
    }

    #[test]
    fn test_forwarding_rule_pinning() {
        let rule = build_forwarding_rule(
            "web-443",
            443,
            "projects/p/global/targetHttpsProxies/web-443",
            Some("203.0.113.9".to_string()),
        );
        assert_eq!(rule.port_range, "443-443");
        assert_eq!(rule.ip_protocol, "TCP");
        assert_eq!(rule.load_balancing_scheme, "EXTERNAL");

        let mut live = rule.clone();
        live.ip_address = Some("203.0.113.10".to_string());
        assert!(address_changed(&live, &rule));
        live.ip_address = Some("203.0.113.9".to_string());
        assert!(!address_changed(&live, &rule));

        // Link pins and ephemeral rules are never treated as moved
        let linked = build_forwarding_rule(
            "web-443",
            443,
            "t",
            Some("projects/p/global/addresses/edge".to_string()),
        );
        assert!(!address_changed(&live, &linked));
        let ephemeral = build_forwarding_rule("web-443", 443, "t", None);
        assert!(!address_changed(&live, &ephemeral));
    }

    #[test]
    fn test_certificate_required_for_https() {
        let mut listener = http_listener("web", 443);
        listener.spec.protocol = "HTTPS".to_string();
        assert!(is_https(&listener));
        assert!(matches!(certificate_id(&listener), Err(CloudError::Validation(_))));

        listener.spec.certificate =
            Some(Certificate { cert_id: String::new(), mode: String::new() });
        assert!(certificate_id(&listener).is_err());

        listener.spec.certificate =
            Some(Certificate { cert_id: "edge-cert".to_string(), mode: String::new() });
        assert_eq!(certificate_id(&listener).unwrap(), "edge-cert");
    }

    #[test]
    fn test_collect_services_dedup() {
        let mut listener = http_listener("web", 443);
        listener.spec.rules =
            vec![rule("a.example.com", "/api", 9000), rule("b.example.com", "/img", 9001)];
        let (_, routes, default_group) = collect_groups(&listener).unwrap();
        let map = build_url_map("web-443", &routes, &default_group, |name| test_link(name));

        let services = collect_services(&map);
        // Default appears once despite being every matcher's fallback
        assert_eq!(services.len(), 3);
        assert!(services.contains(&test_link("web-443-default")));
    }

    #[test]
    fn test_normalize_health() {
        assert_eq!(normalize_health("HEALTHY"), (true, HEALTH_STATUS_HEALTHY));
        assert_eq!(normalize_health("UNHEALTHY"), (false, HEALTH_STATUS_UNHEALTHY));
        assert_eq!(normalize_health("DRAINING"), (false, HEALTH_STATUS_UNKNOWN));
    }
}
