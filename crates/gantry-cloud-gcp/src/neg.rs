//! Zonal network endpoint groups
//!
//! Backend services reference one NEG per zone; each NEG holds the
//! (ip, port) endpoints of that zone. Convergence diffs the listed
//! endpoints against the desired set and attaches/detaches the delta,
//! never recreating a group that still matches.

use std::collections::HashSet;

use tracing::{debug, info};

use gantry_common::error::Result;

use crate::client::ComputeClient;
use crate::model::{
    NetworkEndpoint, NetworkEndpointGroup, NetworkEndpointWithHealth, NetworkEndpointsRequest,
};
use crate::topology::ResolvedEndpoint;

pub const NETWORK_ENDPOINT_TYPE_VM_IP_PORT: &str = "GCE_VM_IP_PORT";

/// Converge one zonal NEG onto the desired endpoint set, returning its
/// self link for use as a backend group
pub async fn ensure_group_endpoints(
    client: &ComputeClient,
    name: &str,
    zone: &str,
    network: &str,
    subnetwork: &str,
    desired: &[ResolvedEndpoint],
) -> Result<String> {
    if client.get_network_endpoint_group(zone, name).await?.is_none() {
        client
            .insert_network_endpoint_group(
                zone,
                &NetworkEndpointGroup {
                    name: name.to_string(),
                    network_endpoint_type: NETWORK_ENDPOINT_TYPE_VM_IP_PORT.to_string(),
                    network: Some(network.to_string()),
                    subnetwork: Some(subnetwork.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        debug!(zone, group = name, "created network endpoint group");
    }

    let existing = client.list_network_endpoints(zone, name).await?;
    let (attach, detach) = endpoint_delta(&existing, desired);

    if !attach.is_empty() {
        client
            .attach_network_endpoints(
                zone,
                name,
                &NetworkEndpointsRequest { network_endpoints: attach.clone() },
            )
            .await?;
    }
    if !detach.is_empty() {
        client
            .detach_network_endpoints(
                zone,
                name,
                &NetworkEndpointsRequest { network_endpoints: detach.clone() },
            )
            .await?;
    }
    if !attach.is_empty() || !detach.is_empty() {
        info!(
            zone,
            group = name,
            attached = attach.len(),
            detached = detach.len(),
            "reconciled network endpoints"
        );
    }
    Ok(client.zonal_link(zone, "networkEndpointGroups", name))
}

/// Endpoints to attach and to detach, keyed by (ip, port)
fn endpoint_delta(
    existing: &[NetworkEndpointWithHealth],
    desired: &[ResolvedEndpoint],
) -> (Vec<NetworkEndpoint>, Vec<NetworkEndpoint>) {
    let existing_keys: HashSet<(&str, i32)> = existing
        .iter()
        .map(|entry| (entry.network_endpoint.ip_address.as_str(), entry.network_endpoint.port))
        .collect();
    let desired_keys: HashSet<(&str, i32)> =
        desired.iter().map(|endpoint| (endpoint.ip.as_str(), endpoint.port)).collect();

    let attach = desired
        .iter()
        .filter(|endpoint| !existing_keys.contains(&(endpoint.ip.as_str(), endpoint.port)))
        .map(|endpoint| NetworkEndpoint {
            instance: Some(endpoint.instance.clone()),
            ip_address: endpoint.ip.clone(),
            port: endpoint.port,
        })
        .collect();
    let detach = existing
        .iter()
        .filter(|entry| {
            !desired_keys
                .contains(&(entry.network_endpoint.ip_address.as_str(), entry.network_endpoint.port))
        })
        .map(|entry| entry.network_endpoint.clone())
        .collect();
    (attach, detach)
}
