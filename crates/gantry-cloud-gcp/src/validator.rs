//! GCP ingress validation
//!
//! Pure checks that run before any compute or cluster call; a failed
//! validation short-circuits the reconcile with no side effects. Health
//! check bounds apply to HTTP(S) rules only: network load balancer
//! listeners delegate to a Kubernetes Service, which carries no cloud
//! probe of its own.

use gantry_api::ingress::{Ingress, IngressPortMapping, IngressRule, IngressServiceRoute};
use gantry_api::model::{HealthCheck, PROTOCOL_HTTP, PROTOCOL_HTTPS, PROTOCOL_TCP, PROTOCOL_UDP};
use gantry_api::validation::{
    intervals_overlap, validate_http_code_values, validate_port, validate_protocol, validate_range,
    validate_resource_name,
};

use crate::l7::{DEFAULT_CHECK_INTERVAL, DEFAULT_CHECK_TIMEOUT};

// Compute health check bounds
pub const CHECK_INTERVAL_MIN: i32 = 1;
pub const CHECK_INTERVAL_MAX: i32 = 300;
pub const CHECK_TIMEOUT_MIN: i32 = 1;
pub const CHECK_TIMEOUT_MAX: i32 = 300;
pub const CHECK_THRESHOLD_MIN: i32 = 1;
pub const CHECK_THRESHOLD_MAX: i32 = 10;
pub const HTTP_CODE_MIN: i32 = 100;
pub const HTTP_CODE_MAX: i32 = 599;

const SUPPORTED_PROTOCOLS: [&str; 4] =
    [PROTOCOL_TCP, PROTOCOL_UDP, PROTOCOL_HTTP, PROTOCOL_HTTPS];

/// Validate every rule and port mapping of an ingress against GCP bounds
///
/// Returns `(false, reason)` on the first violation.
pub fn is_ingress_valid(ingress: &Ingress) -> (bool, String) {
    if validate_resource_name(&ingress.name).is_err() {
        return (false, format!("ingress name '{}' is not a valid resource name", ingress.name));
    }
    // Compute resource names must start with a letter; every derived name
    // starts with the ingress name
    if !ingress.name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return (
            false,
            format!("ingress name '{}' must start with a letter on GCP", ingress.name),
        );
    }
    for rule in &ingress.spec.rules {
        if let Err(message) = check_rule(rule) {
            return (false, message);
        }
    }
    for mapping in &ingress.spec.port_mappings {
        if let Err(message) = check_port_mapping(mapping) {
            return (false, message);
        }
    }
    (true, String::new())
}

/// Detect port collisions between rules and port mappings
pub fn check_no_conflicts_in_ingress(ingress: &Ingress) -> (bool, String) {
    let rules = &ingress.spec.rules;
    for (i, a) in rules.iter().enumerate() {
        for b in rules.iter().skip(i + 1) {
            if a.port == b.port {
                return (false, format!("multiple rules use port {}", a.port));
            }
        }
    }

    let mappings = &ingress.spec.port_mappings;
    for (i, a) in mappings.iter().enumerate() {
        let ia = a.port_interval();
        for b in mappings.iter().skip(i + 1) {
            let ib = b.port_interval();
            if intervals_overlap(ia, ib) {
                return (
                    false,
                    format!(
                        "port mappings [{}, {}) and [{}, {}) overlap",
                        ia.0, ia.1, ib.0, ib.1
                    ),
                );
            }
        }
        for rule in rules {
            if intervals_overlap(ia, (rule.port, rule.port + 1)) {
                return (
                    false,
                    format!("port mapping [{}, {}) covers rule port {}", ia.0, ia.1, rule.port),
                );
            }
        }
    }
    (true, String::new())
}

fn check_rule(rule: &IngressRule) -> Result<(), String> {
    validate_port(rule.port).map_err(|_| format!("rule port {} is out of range", rule.port))?;
    validate_protocol(&rule.protocol, &SUPPORTED_PROTOCOLS)
        .map_err(|_| format!("protocol '{}' is not supported on GCP", rule.protocol))?;
    if rule.protocol.eq_ignore_ascii_case(PROTOCOL_HTTPS) && rule.certificate.is_none() {
        return Err(format!("HTTPS rule on port {} has no certificate", rule.port));
    }
    if let Some(attribute) = &rule.listener_attribute {
        if let Some(health_check) = &attribute.health_check {
            check_health_check(health_check, &rule.protocol)?;
        }
    }
    check_services(&rule.services)?;
    for route in &rule.routes {
        check_services(&route.services)?;
    }
    Ok(())
}

/// A routing target becomes one NEG serving port or one Service target
/// port, so the services behind it must agree on the backend port
fn check_services(services: &[IngressServiceRoute]) -> Result<(), String> {
    for service in services {
        validate_port(service.port).map_err(|_| {
            format!("service '{}' port {} is out of range", service.service_name, service.port)
        })?;
        if service.weight < 0 {
            return Err(format!(
                "service '{}' weight {} is negative",
                service.service_name, service.weight
            ));
        }
    }
    let mut ports = services.iter().map(|service| service.port);
    if let Some(first) = ports.next() {
        if let Some(other) = ports.find(|port| *port != first) {
            return Err(format!(
                "services behind one GCP routing target use different ports {} and {}",
                first, other
            ));
        }
    }
    Ok(())
}

fn check_port_mapping(mapping: &IngressPortMapping) -> Result<(), String> {
    if mapping.start_index < 0 || mapping.end_index <= mapping.start_index {
        return Err(format!(
            "port mapping indexes [{}, {}) are not an increasing range",
            mapping.start_index, mapping.end_index
        ));
    }
    let (start, end) = mapping.port_interval();
    validate_port(start).map_err(|_| format!("port mapping start {} is out of range", start))?;
    validate_port(end - 1).map_err(|_| format!("port mapping end {} is out of range", end - 1))?;
    validate_protocol(&mapping.protocol, &SUPPORTED_PROTOCOLS)
        .map_err(|_| format!("protocol '{}' is not supported on GCP", mapping.protocol))?;
    if mapping.protocol.eq_ignore_ascii_case(PROTOCOL_HTTPS) && mapping.certificate.is_none() {
        return Err(format!("HTTPS port mapping at {} has no certificate", mapping.start_port));
    }
    if let Some(attribute) = &mapping.listener_attribute {
        if let Some(health_check) = &attribute.health_check {
            check_health_check(health_check, &mapping.protocol)?;
        }
    }
    Ok(())
}

/// Bounds are only enforced on fields the user actually set; zero means
/// the compute default applies
fn check_health_check(health_check: &HealthCheck, protocol: &str) -> Result<(), String> {
    if !health_check.enabled {
        return Ok(());
    }
    let layer7 = protocol.eq_ignore_ascii_case(PROTOCOL_HTTP)
        || protocol.eq_ignore_ascii_case(PROTOCOL_HTTPS);
    // No cloud probe exists on the layer-4 path
    if !layer7 {
        return Ok(());
    }
    if health_check.interval_time != 0 {
        validate_range(
            health_check.interval_time,
            CHECK_INTERVAL_MIN,
            CHECK_INTERVAL_MAX,
            "interval_out_of_range",
        )
        .map_err(|_| {
            format!(
                "health check interval {} is outside [{}, {}]",
                health_check.interval_time, CHECK_INTERVAL_MIN, CHECK_INTERVAL_MAX
            )
        })?;
    }
    if health_check.timeout != 0 {
        validate_range(
            health_check.timeout,
            CHECK_TIMEOUT_MIN,
            CHECK_TIMEOUT_MAX,
            "timeout_out_of_range",
        )
        .map_err(|_| {
            format!(
                "health check timeout {} is outside [{}, {}]",
                health_check.timeout, CHECK_TIMEOUT_MIN, CHECK_TIMEOUT_MAX
            )
        })?;
    }
    // The API rejects checks whose timeout exceeds the interval; compare
    // the effective values the reconciler will send
    let interval = if health_check.interval_time != 0 {
        health_check.interval_time
    } else {
        DEFAULT_CHECK_INTERVAL
    };
    let timeout =
        if health_check.timeout != 0 { health_check.timeout } else { DEFAULT_CHECK_TIMEOUT };
    if timeout > interval {
        return Err(format!(
            "health check timeout {} must not exceed the interval {}",
            timeout, interval
        ));
    }
    for (label, value) in [
        ("healthy threshold", health_check.healthy_threshold),
        ("unhealthy threshold", health_check.unhealthy_threshold),
    ] {
        if value != 0 {
            validate_range(value, CHECK_THRESHOLD_MIN, CHECK_THRESHOLD_MAX, "threshold_out_of_range")
                .map_err(|_| {
                    format!(
                        "health check {} {} is outside [{}, {}]",
                        label, value, CHECK_THRESHOLD_MIN, CHECK_THRESHOLD_MAX
                    )
                })?;
        }
    }
    if let Some(codes) = &health_check.http_code {
        validate_http_code_values(codes, HTTP_CODE_MIN, HTTP_CODE_MAX)
            .map_err(|e| format!("health check http codes '{}' are invalid: {}", codes, e.code))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use gantry_api::ingress::IngressSpec;
    use gantry_api::model::{Certificate, ListenerAttribute};

    use super::*;

    fn rule(port: i32, protocol: &str) -> IngressRule {
        IngressRule {
            port,
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }

    fn mapping(start_port: i32, start_index: i32, end_index: i32) -> IngressPortMapping {
        IngressPortMapping {
            start_port,
            start_index,
            end_index,
            protocol: "TCP".to_string(),
            ..Default::default()
        }
    }

    fn ingress(rules: Vec<IngressRule>, mappings: Vec<IngressPortMapping>) -> Ingress {
        Ingress {
            name: "game".to_string(),
            namespace: "prod".to_string(),
            spec: IngressSpec { rules, port_mappings: mappings },
        }
    }

    fn with_health_check(mut rule: IngressRule, health_check: HealthCheck) -> IngressRule {
        rule.listener_attribute = Some(ListenerAttribute {
            health_check: Some(health_check),
            ..Default::default()
        });
        rule
    }

    #[test]
    fn test_valid_ingress_passes() {
        let mut https = rule(443, "HTTPS");
        https.certificate =
            Some(Certificate { cert_id: "edge-cert".to_string(), mode: String::new() });
        let ing = ingress(vec![rule(80, "HTTP"), https], vec![mapping(30000, 0, 10)]);
        let (ok, message) = is_ingress_valid(&ing);
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_name_must_start_with_letter() {
        let mut ing = ingress(vec![rule(80, "HTTP")], Vec::new());
        ing.name = "9game".to_string();
        let (ok, message) = is_ingress_valid(&ing);
        assert!(!ok);
        assert!(message.contains("start with a letter"));
    }

    #[test]
    fn test_https_rule_requires_certificate() {
        let ing = ingress(vec![rule(443, "HTTPS")], Vec::new());
        let (ok, message) = is_ingress_valid(&ing);
        assert!(!ok);
        assert!(message.contains("certificate"));
    }

    #[test]
    fn test_interval_bounds() {
        let bad = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, interval_time: 301, ..Default::default() },
        );
        let (ok, message) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);
        assert!(message.contains("interval"));

        let good = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, interval_time: 300, timeout: 300, ..Default::default() },
        );
        let (ok, message) = is_ingress_valid(&ingress(vec![good], Vec::new()));
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_timeout_must_not_exceed_interval() {
        let bad = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, interval_time: 10, timeout: 30, ..Default::default() },
        );
        let (ok, message) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);
        assert!(message.contains("must not exceed"));

        // An explicit timeout is compared to the default interval too
        let bad = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, timeout: 30, ..Default::default() },
        );
        let (ok, _) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);

        let good = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, timeout: 3, ..Default::default() },
        );
        let (ok, message) = is_ingress_valid(&ingress(vec![good], Vec::new()));
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_layer4_health_checks_are_not_bounded() {
        // The Service path has no cloud probe, so nothing to bound
        let check = HealthCheck { enabled: true, timeout: 1_000_000, ..Default::default() };
        let (ok, message) =
            is_ingress_valid(&ingress(vec![with_health_check(rule(53, "UDP"), check)], Vec::new()));
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_threshold_and_code_bounds() {
        let bad = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, unhealthy_threshold: 11, ..Default::default() },
        );
        let (ok, _) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);

        let bad = with_health_check(
            rule(80, "HTTP"),
            HealthCheck { enabled: true, http_code: Some("99".to_string()), ..Default::default() },
        );
        let (ok, _) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);

        let good = with_health_check(
            rule(80, "HTTP"),
            HealthCheck {
                enabled: true,
                interval_time: 30,
                timeout: 10,
                unhealthy_threshold: 3,
                http_code: Some("200-399,503".to_string()),
                ..Default::default()
            },
        );
        let (ok, message) = is_ingress_valid(&ingress(vec![good], Vec::new()));
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_services_must_share_a_backend_port() {
        let mut mixed = rule(80, "HTTP");
        mixed.services = vec![
            IngressServiceRoute {
                service_name: "a".to_string(),
                port: 8080,
                ..Default::default()
            },
            IngressServiceRoute {
                service_name: "b".to_string(),
                port: 9090,
                ..Default::default()
            },
        ];
        let (ok, message) = is_ingress_valid(&ingress(vec![mixed], Vec::new()));
        assert!(!ok);
        assert!(message.contains("different ports"));
    }

    #[test]
    fn test_port_conflicts() {
        let ing = ingress(vec![rule(8080, "TCP"), rule(8080, "UDP")], Vec::new());
        let (ok, _) = check_no_conflicts_in_ingress(&ing);
        assert!(!ok);

        let ing = ingress(vec![rule(30005, "TCP")], vec![mapping(30000, 0, 10)]);
        let (ok, _) = check_no_conflicts_in_ingress(&ing);
        assert!(!ok);

        let ing = ingress(
            vec![rule(8080, "TCP")],
            vec![mapping(30000, 0, 10), mapping(30010, 0, 10)],
        );
        let (ok, message) = check_no_conflicts_in_ingress(&ing);
        assert!(ok, "{}", message);
    }
}
