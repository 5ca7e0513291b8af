//! Ingress data models
//!
//! The ingress is the user-facing input that reconcilers expand into
//! [`Listener`](crate::model::Listener)s: fixed-port rules plus port
//! mappings that open a whole range of ports at once. Validators consume
//! these models before any cloud call is made.

use serde::{Deserialize, Serialize};

/// User-facing ingress description
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    pub name: String,
    pub namespace: String,
    pub spec: IngressSpec,
}

impl Ingress {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub port_mappings: Vec<IngressPortMapping>,
}

/// One fixed-port ingress rule, mapping a frontend port to services
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    pub port: i32,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<super::model::Certificate>,
    /// Layer-4 backends, used when the rule has no layer-7 routes
    #[serde(default)]
    pub services: Vec<IngressServiceRoute>,
    /// Layer-7 host/path routes
    #[serde(default)]
    pub routes: Vec<IngressRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_attribute: Option<super::model::ListenerAttribute>,
}

/// Layer-7 route inside an ingress rule
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRoute {
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub services: Vec<IngressServiceRoute>,
}

/// Backend service reference of an ingress rule or route
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressServiceRoute {
    pub service_name: String,
    pub service_namespace: String,
    pub port: i32,
    #[serde(default)]
    pub weight: i32,
}

/// Port range opened for a group of workload indexes
///
/// Workload index `i` listens on frontend port `start_port + i`, so the
/// mapping occupies the half-open interval
/// `[start_port + start_index, start_port + end_index)`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressPortMapping {
    pub start_port: i32,
    #[serde(default)]
    pub start_index: i32,
    pub end_index: i32,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<super::model::Certificate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_attribute: Option<super::model::ListenerAttribute>,
}

impl IngressPortMapping {
    /// Occupied frontend ports as a half-open `[start, end)` interval
    pub fn port_interval(&self) -> (i32, i32) {
        (self.start_port + self.start_index, self.start_port + self.end_index)
    }
}
