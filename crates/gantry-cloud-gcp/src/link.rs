//! Self-link parsing and deterministic resource naming
//!
//! Compute resources reference each other by URL. The reconciler never
//! stores those links; it re-derives every name from the listener inputs,
//! so a second ensure always finds the resources the first one created.
//! Names respect the 63 character RFC 1035 limit via `compact_name`.

use gantry_api::model::{Listener, ListenerRule};
use gantry_common::naming::{compact_name, sanitize_name, short_hash};

/// Compute resource name length limit
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Last path segment of a self link, the bare resource name
pub fn resource_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

/// Value of a path key inside a link, e.g. `zones` -> `us-central1-b`
fn path_value<'a>(link: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = link.split('/');
    while let Some(part) = parts.next() {
        if part == key {
            return parts.next().filter(|value| !value.is_empty());
        }
    }
    None
}

/// Zone name carried in a link, if any
pub fn zone_of(link: &str) -> Option<&str> {
    path_value(link, "zones")
}

/// Region name carried in a link, if any
pub fn region_of(link: &str) -> Option<&str> {
    path_value(link, "regions")
}

/// Whether a value is a resource link rather than a bare name
pub fn is_self_link(value: &str) -> bool {
    value.starts_with("https://") || value.starts_with("projects/")
}

/// Whether a value is a literal IP address
pub fn is_ip_address(value: &str) -> bool {
    value.parse::<std::net::IpAddr>().is_ok()
}

fn gcp_name(raw: &str) -> String {
    sanitize_name(raw).to_lowercase()
}

/// Name prefix claiming a resource for a listener
pub fn listener_prefix(listener: &Listener) -> String {
    format!("{}-", gcp_name(&listener.name))
}

/// Base name shared by the frontend resources of one listener
pub fn listener_resource_name(listener: &Listener) -> String {
    format!("{}-{}", gcp_name(&listener.name), listener.spec.port)
}

/// Backend service name for the listener default target group
pub fn default_group_name(listener: &Listener) -> String {
    format!("{}-default", listener_resource_name(listener))
}

/// Backend service name for one routing rule
///
/// Domain and path flow through a hash so the name survives characters
/// resource names reject.
pub fn rule_group_name(listener: &Listener, rule: &ListenerRule) -> String {
    let discriminator = format!("{}/{}/{}", rule.domain, rule.path, listener.spec.port);
    format!("{}-{}", gcp_name(&listener.name), short_hash(&discriminator))
}

/// Zonal network endpoint group name for one backend service
pub fn neg_name(group: &str, zone: &str) -> String {
    compact_name(group, zone, MAX_RESOURCE_NAME_LEN)
}

/// URL map path matcher name for one host
pub fn matcher_name(base: &str, domain: &str) -> String {
    let host = if domain.is_empty() { "all" } else { domain };
    compact_name(base, host, MAX_RESOURCE_NAME_LEN)
}
