//! Typed subset of the compute v1 REST resources
//!
//! Only the fields the reconciler reads or writes are typed. Resources
//! that are read, modified and written back (`BackendService`, `UrlMap`)
//! keep unknown fields in `extra` and echo the server `fingerprint`, which
//! the update endpoints require for optimistic concurrency.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OPERATION_STATUS_DONE: &str = "DONE";

pub const HEALTH_STATE_HEALTHY: &str = "HEALTHY";
pub const HEALTH_STATE_UNHEALTHY: &str = "UNHEALTHY";

/// Result handle of every compute mutation
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    /// Zone link, set only on zonal operations
    #[serde(default)]
    pub zone: Option<String>,
    /// Region link, set only on regional operations
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub target_link: Option<String>,
    #[serde(default)]
    pub error: Option<OperationErrors>,
    #[serde(default)]
    pub http_error_status_code: Option<i32>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == OPERATION_STATUS_DONE
    }

    /// First embedded error, rendered as `code: message`
    pub fn error_message(&self) -> Option<String> {
        let errors = self.error.as_ref()?;
        let first = errors.errors.first()?;
        Some(format!("{}: {}", first.code, first.message))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationError>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Generic list page; every compute list endpoint shares this envelope
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl<T> Default for ListResponse<T> {
    fn default() -> Self {
        Self { items: Vec::new(), next_page_token: None }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: String,
    pub check_interval_sec: i32,
    pub timeout_sec: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_health_check: Option<TcpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_health_check: Option<HttpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_health_check: Option<HttpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpHealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_specification: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_specification: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub name: String,
    pub protocol: String,
    pub load_balancing_scheme: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub health_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_cookie_ttl_sec: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One backend group reference of a backend service
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balancing_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rate_per_endpoint: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointGroup {
    pub name: String,
    pub network_endpoint_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default)]
    pub size: i32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoint {
    /// Instance name, required for attach and detach of VM endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub ip_address: String,
    pub port: i32,
}

/// Body of attach/detachNetworkEndpoints
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointsRequest {
    pub network_endpoints: Vec<NetworkEndpoint>,
}

/// One entry of a listNetworkEndpoints page
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpointWithHealth {
    #[serde(default)]
    pub network_endpoint: NetworkEndpoint,
}

/// Body of backendServices.getHealth
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroupReference {
    pub group: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendServiceGroupHealth {
    #[serde(default)]
    pub health_status: Vec<HealthStatus>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub health_state: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlMap {
    pub name: String,
    pub default_service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_rules: Vec<HostRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_matchers: Vec<PathMatcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRule {
    pub hosts: Vec<String>,
    pub path_matcher: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMatcher {
    pub name: String,
    pub default_service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_rules: Vec<PathRule>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub paths: Vec<String>,
    pub service: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHttpProxy {
    pub name: String,
    pub url_map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHttpsProxy {
    pub name: String,
    pub url_map: String,
    #[serde(default)]
    pub ssl_certificates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

/// Body of targetHttpProxies.setUrlMap / targetHttpsProxies.setUrlMap
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlMapReference {
    pub url_map: String,
}

/// Body of targetHttpsProxies.setSslCertificates
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SslCertificatesRequest {
    pub ssl_certificates: Vec<String>,
}

/// Body of forwardingRules.setTarget
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    pub target: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingRule {
    pub name: String,
    /// Literal address or link of a reserved address resource. The
    /// compute wire name is capitalized.
    #[serde(default, rename = "IPAddress", skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    pub port_range: String,
    pub target: String,
    pub load_balancing_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
}

impl ForwardingRule {
    /// Leading port of the `port_range`, e.g. 443 for `"443-443"`
    pub fn frontend_port(&self) -> i32 {
        self.port_range
            .split('-')
            .next()
            .and_then(|port| port.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub name: String,
    /// Zone link of the instance
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub self_link: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub subnetwork: Option<String>,
    #[serde(default, rename = "networkIP")]
    pub network_ip: Option<String>,
}

/// Error envelope of every non-2xx compute response
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GoogleErrorResponse {
    #[serde(default)]
    pub error: Option<GoogleError>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GoogleError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<GoogleErrorItem>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GoogleErrorItem {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl GoogleErrorResponse {
    /// Machine reason of the first error item, e.g. `rateLimitExceeded`
    pub fn reason(&self) -> &str {
        self.error
            .as_ref()
            .and_then(|error| error.errors.first())
            .map(|item| item.reason.as_str())
            .unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.error.as_ref().map(|error| error.message.as_str()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_rule_capitalized_wire_names() {
        let rule = ForwardingRule {
            name: "web-443".to_string(),
            ip_address: Some("203.0.113.9".to_string()),
            ip_protocol: "TCP".to_string(),
            port_range: "443-443".to_string(),
            target: "projects/p/global/targetHttpsProxies/web-443".to_string(),
            load_balancing_scheme: "EXTERNAL".to_string(),
            self_link: None,
        };
        let out = serde_json::to_value(&rule).unwrap();
        assert_eq!(out["IPAddress"], "203.0.113.9");
        assert_eq!(out["IPProtocol"], "TCP");
        assert_eq!(out["portRange"], "443-443");

        let parsed: ForwardingRule = serde_json::from_value(out).unwrap();
        assert_eq!(parsed.frontend_port(), 443);
    }

    #[test]
    fn test_operation_error_extraction() {
        let op: Operation = serde_json::from_str(
            r#"{
                "name": "operation-1",
                "status": "DONE",
                "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "too many rules"}]}
            }"#,
        )
        .unwrap();
        assert!(op.is_done());
        assert_eq!(op.error_message().unwrap(), "QUOTA_EXCEEDED: too many rules");

        let running: Operation =
            serde_json::from_str(r#"{"name": "operation-2", "status": "RUNNING"}"#).unwrap();
        assert!(!running.is_done());
        assert!(running.error_message().is_none());
    }

    #[test]
    fn test_backend_service_round_trip_preserves_unknown_fields() {
        let raw = r#"{
            "name": "web-443-default",
            "protocol": "HTTP",
            "loadBalancingScheme": "EXTERNAL",
            "backends": [{"group": "zones/us-central1-b/networkEndpointGroups/web", "balancingMode": "RATE"}],
            "healthChecks": ["global/healthChecks/web-443-default"],
            "fingerprint": "abc123=",
            "connectionDraining": {"drainingTimeoutSec": 300}
        }"#;
        let mut service: BackendService = serde_json::from_str(raw).unwrap();
        service.backends.push(Backend {
            group: "zones/us-east1-c/networkEndpointGroups/web".to_string(),
            balancing_mode: Some("RATE".to_string()),
            max_rate_per_endpoint: Some(100.0),
        });

        let out = serde_json::to_value(&service).unwrap();
        assert_eq!(out["fingerprint"], "abc123=");
        assert_eq!(out["connectionDraining"]["drainingTimeoutSec"], 300);
        assert_eq!(out["backends"][1]["maxRatePerEndpoint"], 100.0);
    }

    #[test]
    fn test_get_health_field_names() {
        let health: BackendServiceGroupHealth = serde_json::from_str(
            r#"{
                "healthStatus": [
                    {"ipAddress": "10.0.0.7", "port": 8080, "healthState": "HEALTHY"},
                    {"ipAddress": "10.0.0.8", "port": 8080, "healthState": "UNHEALTHY"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(health.health_status.len(), 2);
        assert_eq!(health.health_status[0].health_state, HEALTH_STATE_HEALTHY);
    }

    #[test]
    fn test_instance_network_ip_rename() {
        let instance: Instance = serde_json::from_str(
            r#"{
                "name": "gke-node-1",
                "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-b",
                "networkInterfaces": [{"network": "projects/p/global/networks/vpc", "networkIP": "10.0.0.7"}]
            }"#,
        )
        .unwrap();
        assert_eq!(instance.network_interfaces[0].network_ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_error_envelope_reason() {
        let response: GoogleErrorResponse = serde_json::from_str(
            r#"{"error": {"code": 403, "message": "Quota exceeded", "errors": [{"reason": "rateLimitExceeded", "message": "Quota exceeded"}]}}"#,
        )
        .unwrap();
        assert_eq!(response.reason(), "rateLimitExceeded");
        assert_eq!(response.message(), "Quota exceeded");
    }
}
