//! Listener data models shared by every cloud reconciler
//!
//! This module defines the cloud-neutral description of a load balancer
//! listener: the listening port (or port segment), the protocol, the backend
//! target group and, for layer-7 listeners, the host/path rules. Reconcilers
//! translate these models into provider resources and report back with
//! [`ListenerResult`] / [`BackendHealthStatus`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

// Listener protocol constants
pub const PROTOCOL_TCP: &str = "TCP";
pub const PROTOCOL_UDP: &str = "UDP";
pub const PROTOCOL_HTTP: &str = "HTTP";
pub const PROTOCOL_HTTPS: &str = "HTTPS";

// Backend weight applied when the field is omitted
pub const DEFAULT_BACKEND_WEIGHT: i32 = 10;

// Normalized backend health states reported by describe_backend_status
pub const HEALTH_STATUS_HEALTHY: &str = "Healthy";
pub const HEALTH_STATUS_UNHEALTHY: &str = "Unhealthy";
pub const HEALTH_STATUS_UNKNOWN: &str = "Unknown";

/// Cloud-neutral listener description
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub namespace: String,
    pub spec: ListenerSpec,
}

impl Listener {
    pub fn new(name: String, namespace: String, spec: ListenerSpec) -> Self {
        Self { name, namespace, spec }
    }

    /// Generate listener key for map storage
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// A listener with a populated end port covers the whole port segment
    /// `[port, end_port]` rather than a single port.
    pub fn is_segment(&self) -> bool {
        self.spec.end_port > 0
    }

    /// HTTP/HTTPS listeners carry rules and are reconciled as layer 7.
    pub fn is_layer7(&self) -> bool {
        let protocol = self.spec.protocol.to_uppercase();
        protocol == PROTOCOL_HTTP || protocol == PROTOCOL_HTTPS
    }
}

/// Desired state of a single listener
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    /// Provider resource id of the load balancer the listener belongs to
    pub loadbalancer_id: String,
    pub port: i32,
    /// End of the port segment; 0 means a plain single-port listener
    #[serde(default)]
    pub end_port: i32,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group: Option<TargetGroup>,
    /// Host/path routing rules, only meaningful for layer-7 listeners
    #[serde(default)]
    pub rules: Vec<ListenerRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_attribute: Option<ListenerAttribute>,
}

/// TLS certificate reference, already resolved to a provider certificate id
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub cert_id: String,
    pub mode: String,
}

/// One host/path routing rule of a layer-7 listener
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRule {
    pub domain: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group: Option<TargetGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_attribute: Option<ListenerAttribute>,
}

impl ListenerRule {
    /// Rule identity inside one listener; the cloud rule id is never stored
    /// so reconcilers re-derive matches from this key.
    pub fn key(&self) -> String {
        format!("{}{}", self.domain, self.path)
    }
}

/// Set of backends a listener or rule forwards to
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroup {
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
}

impl TargetGroup {
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backends keyed by (ip, port) for diffing against cloud state
    pub fn backend_set(&self) -> HashSet<(String, i32)> {
        self.backends.iter().map(|b| (b.ip.clone(), b.port)).collect()
    }

    /// The common backend port if every backend shares one, `None` otherwise.
    /// Azure load balancing rules can only forward to a single backend port.
    pub fn uniform_backend_port(&self) -> Option<i32> {
        let mut ports = self.backends.iter().map(|b| b.port);
        let first = ports.next()?;
        if ports.all(|p| p == first) { Some(first) } else { None }
    }
}

/// A single backend endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub ip: String,
    pub port: i32,
    #[serde(default = "default_backend_weight")]
    pub weight: i32,
}

impl Default for Backend {
    fn default() -> Self {
        Self { ip: String::new(), port: 0, weight: DEFAULT_BACKEND_WEIGHT }
    }
}

impl Backend {
    pub fn new(ip: String, port: i32) -> Self {
        Self { ip, port, weight: DEFAULT_BACKEND_WEIGHT }
    }
}

fn default_backend_weight() -> i32 {
    DEFAULT_BACKEND_WEIGHT
}

/// Tunable listener behavior beyond port/protocol/backends
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerAttribute {
    /// Session persistence time in seconds; 0 disables stickiness
    #[serde(default)]
    pub session_time: i32,
    /// Provider load balancing policy name, e.g. round robin variants
    #[serde(default)]
    pub lb_policy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Listener health check configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub enabled: bool,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub interval_time: i32,
    #[serde(default)]
    pub healthy_threshold: i32,
    #[serde(default)]
    pub unhealthy_threshold: i32,
    /// Expected HTTP codes, single values/ranges joined by commas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_code: Option<String>,
    #[serde(default)]
    pub http_check_path: String,
    #[serde(default)]
    pub http_check_method: String,
}

/// Per-listener outcome of a batch reconcile
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerResult {
    pub is_error: bool,
    /// Rendered error when is_error is set
    #[serde(default)]
    pub message: String,
    /// Provider listener id on success
    #[serde(default)]
    pub listener_id: String,
}

impl ListenerResult {
    pub fn ok(listener_id: String) -> Self {
        Self { is_error: false, message: String::new(), listener_id }
    }

    pub fn err(message: String) -> Self {
        Self { is_error: true, message, listener_id: String::new() }
    }
}

/// Health of one backend behind one listener
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealthStatus {
    pub ip: String,
    pub port: i32,
    pub protocol: String,
    /// Frontend port of the listener the backend serves
    pub listener_port: i32,
    pub healthy: bool,
    /// Provider health string normalized to the HEALTH_STATUS_* constants
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group_name: Option<String>,
}

/// Normalized load balancer attributes returned by describe
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerObject {
    pub lb_id: String,
    pub region: String,
    pub name: String,
    /// Provider flavor, e.g. application/network on AWS
    #[serde(default)]
    pub lb_type: String,
    #[serde(default)]
    pub vpc_id: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

/// One accelerator port mapped to one local port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPair {
    pub cloud_port: i32,
    pub local_port: i32,
}

impl PortPair {
    pub fn new(cloud_port: i32, local_port: i32) -> Self {
        Self { cloud_port, local_port }
    }
}

/// A run of consecutive port pairs compressed into one range mapping
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgaMappingInfo {
    pub cloud_start_port: i32,
    pub cloud_end_port: i32,
    pub local_start_port: i32,
    pub local_end_port: i32,
}
