//! AWS ingress validation
//!
//! Pure checks that run before any cloud call; a failed validation
//! short-circuits the reconcile with no side effects.

use gantry_api::ingress::{Ingress, IngressPortMapping, IngressRule, IngressServiceRoute};
use gantry_api::model::{HealthCheck, PROTOCOL_HTTP, PROTOCOL_HTTPS, PROTOCOL_TCP, PROTOCOL_UDP};
use gantry_api::validation::{
    intervals_overlap, validate_http_code_values, validate_port, validate_protocol, validate_range,
    validate_resource_name,
};

// ELBv2 health check bounds
pub const HEALTH_CHECK_INTERVAL_MIN: i32 = 5;
pub const HEALTH_CHECK_INTERVAL_MAX: i32 = 300;
pub const HEALTH_CHECK_TIMEOUT_MIN: i32 = 2;
pub const HEALTH_CHECK_TIMEOUT_MAX: i32 = 120;
pub const HEALTH_CHECK_THRESHOLD_MIN: i32 = 2;
pub const HEALTH_CHECK_THRESHOLD_MAX: i32 = 10;
pub const HTTP_CODE_MIN: i32 = 200;
pub const HTTP_CODE_MAX: i32 = 499;

const SUPPORTED_PROTOCOLS: [&str; 4] =
    [PROTOCOL_TCP, PROTOCOL_UDP, PROTOCOL_HTTP, PROTOCOL_HTTPS];

/// Validate every rule and port mapping of an ingress against AWS bounds
///
/// Returns `(false, reason)` on the first violation.
pub fn is_ingress_valid(ingress: &Ingress) -> (bool, String) {
    // The ingress name seeds every derived resource name
    if validate_resource_name(&ingress.name).is_err() {
        return (false, format!("ingress name '{}' is not a valid resource name", ingress.name));
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
///
/// Returns `(false, reason)` when any two rules share a port, any two port
/// mapping intervals overlap, or a mapping interval covers a rule port.
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
        .map_err(|_| format!("protocol '{}' is not supported on AWS", rule.protocol))?;
    if rule.protocol.eq_ignore_ascii_case(PROTOCOL_HTTPS) && rule.certificate.is_none() {
        return Err(format!("HTTPS rule on port {} has no certificate", rule.port));
    }
    if let Some(attribute) = &rule.listener_attribute {
        if let Some(health_check) = &attribute.health_check {
            check_health_check(health_check)?;
        }
    }
    check_services(&rule.services)?;
    for route in &rule.routes {
        check_services(&route.services)?;
    }
    Ok(())
}

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
        .map_err(|_| format!("protocol '{}' is not supported on AWS", mapping.protocol))?;
    if mapping.protocol.eq_ignore_ascii_case(PROTOCOL_HTTPS) && mapping.certificate.is_none() {
        return Err(format!("HTTPS port mapping at {} has no certificate", mapping.start_port));
    }
    if let Some(attribute) = &mapping.listener_attribute {
        if let Some(health_check) = &attribute.health_check {
            check_health_check(health_check)?;
        }
    }
    Ok(())
}

/// Bounds are only enforced on fields the user actually set; zero means the
/// cloud default applies
fn check_health_check(health_check: &HealthCheck) -> Result<(), String> {
    if !health_check.enabled {
        return Ok(());
    }
    if health_check.interval_time != 0 {
        validate_range(
            health_check.interval_time,
            HEALTH_CHECK_INTERVAL_MIN,
            HEALTH_CHECK_INTERVAL_MAX,
            "interval_out_of_range",
        )
        .map_err(|_| {
            format!(
                "health check interval {} is outside [{}, {}]",
                health_check.interval_time, HEALTH_CHECK_INTERVAL_MIN, HEALTH_CHECK_INTERVAL_MAX
            )
        })?;
    }
    if health_check.timeout != 0 {
        validate_range(
            health_check.timeout,
            HEALTH_CHECK_TIMEOUT_MIN,
            HEALTH_CHECK_TIMEOUT_MAX,
            "timeout_out_of_range",
        )
        .map_err(|_| {
            format!(
                "health check timeout {} is outside [{}, {}]",
                health_check.timeout, HEALTH_CHECK_TIMEOUT_MIN, HEALTH_CHECK_TIMEOUT_MAX
            )
        })?;
    }
    for (label, value) in [
        ("healthy threshold", health_check.healthy_threshold),
        ("unhealthy threshold", health_check.unhealthy_threshold),
    ] {
        if value != 0 {
            validate_range(
                value,
                HEALTH_CHECK_THRESHOLD_MIN,
                HEALTH_CHECK_THRESHOLD_MAX,
                "threshold_out_of_range",
            )
            .map_err(|_| {
                format!(
                    "health check {} {} is outside [{}, {}]",
                    label, value, HEALTH_CHECK_THRESHOLD_MIN, HEALTH_CHECK_THRESHOLD_MAX
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

    #[test]
    fn test_valid_ingress_passes() {
        let mut https = rule(443, "HTTPS");
        https.certificate = Some(Certificate {
            cert_id: "arn:aws:acm:us-east-1:1:certificate/x".to_string(),
            mode: "UNIDIRECTIONAL".to_string(),
        });
        let ing = ingress(vec![rule(80, "HTTP"), https], vec![mapping(30000, 0, 10)]);
        let (ok, message) = is_ingress_valid(&ing);
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_https_rule_requires_certificate() {
        let ing = ingress(vec![rule(443, "HTTPS")], Vec::new());
        let (ok, message) = is_ingress_valid(&ing);
        assert!(!ok);
        assert!(message.contains("certificate"));
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let ing = ingress(vec![rule(80, "SCTP")], Vec::new());
        let (ok, _) = is_ingress_valid(&ing);
        assert!(!ok);
    }

    #[test]
    fn test_invalid_ingress_name_rejected() {
        let mut ing = ingress(vec![rule(80, "HTTP")], Vec::new());
        ing.name = "bad/name".to_string();
        let (ok, message) = is_ingress_valid(&ing);
        assert!(!ok);
        assert!(message.contains("name"));
    }

    #[test]
    fn test_health_check_bounds() {
        let mut bad = rule(80, "HTTP");
        bad.listener_attribute = Some(ListenerAttribute {
            health_check: Some(HealthCheck {
                enabled: true,
                interval_time: 3,
                ..Default::default()
            }),
            ..Default::default()
        });
        let (ok, message) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);
        assert!(message.contains("interval"));

        let mut good = rule(80, "HTTP");
        good.listener_attribute = Some(ListenerAttribute {
            health_check: Some(HealthCheck {
                enabled: true,
                interval_time: 30,
                timeout: 5,
                healthy_threshold: 3,
                unhealthy_threshold: 3,
                http_code: Some("200-399".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let (ok, message) = is_ingress_valid(&ingress(vec![good], Vec::new()));
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_bad_http_codes_rejected() {
        let mut bad = rule(80, "HTTP");
        bad.listener_attribute = Some(ListenerAttribute {
            health_check: Some(HealthCheck {
                enabled: true,
                http_code: Some("299-200".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let (ok, _) = is_ingress_valid(&ingress(vec![bad], Vec::new()));
        assert!(!ok);
    }

    #[test]
    fn test_duplicate_rule_ports_conflict() {
        let ing = ingress(vec![rule(8080, "TCP"), rule(8080, "UDP")], Vec::new());
        let (ok, message) = check_no_conflicts_in_ingress(&ing);
        assert!(!ok);
        assert!(message.contains("8080"));
    }

    #[test]
    fn test_mapping_covering_rule_port_conflicts() {
        let ing = ingress(vec![rule(30005, "TCP")], vec![mapping(30000, 0, 10)]);
        let (ok, _) = check_no_conflicts_in_ingress(&ing);
        assert!(!ok);
    }

    #[test]
    fn test_disjoint_ports_do_not_conflict() {
        let ing = ingress(
            vec![rule(8080, "TCP")],
            vec![mapping(30000, 0, 10), mapping(30010, 0, 10)],
        );
        let (ok, message) = check_no_conflicts_in_ingress(&ing);
        assert!(ok, "{}", message);
    }

    #[test]
    fn test_overlapping_mappings_conflict() {
        let ing = ingress(Vec::new(), vec![mapping(30000, 0, 10), mapping(30005, 0, 10)]);
        let (ok, _) = check_no_conflicts_in_ingress(&ing);
        assert!(!ok);
    }

    #[test]
    fn test_mapping_index_order() {
        let ing = ingress(Vec::new(), vec![mapping(30000, 5, 5)]);
        let (ok, _) = is_ingress_valid(&ing);
        assert!(!ok);
    }
}
