//! ARM resource ids and deterministic sub-resource names
//!
//! Sub-resources carry the owning listener's name as a prefix, so repeated
//! reconciliation re-discovers them by name alone and resources carrying a
//! different listener's prefix are never touched.

use gantry_api::model::{Listener, ListenerRule};
use gantry_common::naming;

pub const KIND_LOAD_BALANCERS: &str = "loadBalancers";
pub const KIND_APPLICATION_GATEWAYS: &str = "applicationGateways";
pub const KIND_VIRTUAL_NETWORKS: &str = "virtualNetworks";

/// Build the ARM id of a top-level Microsoft.Network resource
pub fn network_resource_id(
    subscription_id: &str,
    resource_group: &str,
    kind: &str,
    name: &str,
) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/{}/{}",
        subscription_id, resource_group, kind, name
    )
}

/// Build the ARM id of a child collection entry, e.g. a backend pool
pub fn child_resource_id(parent_id: &str, collection: &str, name: &str) -> String {
    format!("{}/{}/{}", parent_id, collection, name)
}

/// Final name segment of an ARM resource id
pub fn resource_name(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Whether the listener's load balancer id is a full ARM id or a bare name
pub fn is_resource_id(lb_id: &str) -> bool {
    lb_id.starts_with("/subscriptions/")
}

pub fn is_application_gateway_id(lb_id: &str) -> bool {
    lb_id.contains("/applicationGateways/")
}

/// Name prefix marking sub-resources owned by this listener
pub fn listener_prefix(listener: &Listener) -> String {
    format!("{}-", listener.name)
}

/// Whether a sub-resource name belongs to this listener
pub fn owned_by(listener: &Listener, name: Option<&str>) -> bool {
    name.is_some_and(|n| n.starts_with(&listener_prefix(listener)))
}

/// Base name for the listener-scoped sub-resources (rule, probe, pool)
pub fn listener_resource_name(listener: &Listener) -> String {
    format!("{}-{}", listener.name, listener.spec.port)
}

/// Name for the sub-resources serving one layer-7 rule
pub fn rule_resource_name(listener: &Listener, rule: &ListenerRule) -> String {
    format!(
        "{}-{}",
        listener.name,
        naming::short_hash(&format!("{}/{}/{}", rule.domain, rule.path, listener.spec.port))
    )
}

#[cfg(test)]
mod tests {
    use gantry_api::model::ListenerSpec;

    use super::*;

    fn listener(name: &str, port: i32) -> Listener {
        let mut listener = Listener::new(name.to_string(), "default".to_string(), ListenerSpec::default());
        listener.spec.port = port;
        listener
    }

    #[test]
    fn test_network_resource_id() {
        let id = network_resource_id("sub-1", "rg-1", KIND_LOAD_BALANCERS, "lb-1");
        assert_eq!(
            id,
            "/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.Network/loadBalancers/lb-1"
        );
        assert!(is_resource_id(&id));
        assert!(!is_application_gateway_id(&id));
        assert_eq!(resource_name(&id), "lb-1");

        let child = child_resource_id(&id, "backendAddressPools", "web-80");
        assert!(child.ends_with("/backendAddressPools/web-80"));
    }

    #[test]
    fn test_ownership_prefix() {
        let web = listener("web", 80);
        assert!(owned_by(&web, Some("web-80")));
        assert!(owned_by(&web, Some("web-a1b2c3d4")));
        assert!(!owned_by(&web, Some("api-80")));
        assert!(!owned_by(&web, None));
    }

    #[test]
    fn test_rule_names_are_deterministic() {
        let web = listener("web", 443);
        let rule = ListenerRule {
            domain: "example.com".to_string(),
            path: "/api".to_string(),
            ..Default::default()
        };
        let a = rule_resource_name(&web, &rule);
        let b = rule_resource_name(&web, &rule);
        assert_eq!(a, b);
        assert!(a.starts_with("web-"));
        assert_ne!(a, listener_resource_name(&web));
    }
}
