//! Global Accelerator custom routing reconciliation
//!
//! A segment listener whose load balancer id is a Global Accelerator ARN is
//! not expanded into N listeners. Custom routing maps a contiguous
//! accelerator port range onto a contiguous endpoint port range, so the
//! desired `(cloud_port, local_port)` pairs are compressed into runs and the
//! accelerator's listener and endpoint group are converged to those runs.

use tracing::{debug, info};

use gantry_api::model::{AgaMappingInfo, Listener, PortPair};
use gantry_common::{CloudError, Result};

use crate::sdk::AwsSdk;

/// Compress port pairs into contiguous runs
///
/// A run extends while both the cloud port and the local port increase by
/// exactly one. The result is sorted by cloud start port.
pub fn split_port_mappings(mut pairs: Vec<PortPair>) -> Vec<AgaMappingInfo> {
    if pairs.is_empty() {
        return Vec::new();
    }
    pairs.sort_by_key(|p| p.cloud_port);

    let mut runs = Vec::new();
    let mut start = pairs[0];
    let mut prev = pairs[0];
    for pair in pairs.iter().skip(1) {
        if pair.cloud_port == prev.cloud_port + 1 && pair.local_port == prev.local_port + 1 {
            prev = *pair;
            continue;
        }
        runs.push(run_of(start, prev));
        start = *pair;
        prev = *pair;
    }
    runs.push(run_of(start, prev));
    runs
}

fn run_of(start: PortPair, end: PortPair) -> AgaMappingInfo {
    AgaMappingInfo {
        cloud_start_port: start.cloud_port,
        cloud_end_port: end.cloud_port,
        local_start_port: start.local_port,
        local_end_port: end.local_port,
    }
}

/// Desired cloud/local port pairs of one segment listener
///
/// Cloud port `port + i` forwards to local port `backend_port + i`, matching
/// the offsets segment expansion applies on the other clouds.
pub fn desired_port_pairs(listener: &Listener) -> Result<Vec<PortPair>> {
    let local_start = listener
        .spec
        .target_group
        .as_ref()
        .and_then(|tg| tg.backends.first())
        .map(|b| b.port)
        .ok_or_else(|| {
            CloudError::Validation(format!(
                "segment listener '{}' has no backends to map accelerator ports onto",
                listener.key()
            ))
        })?;

    let end = listener.spec.end_port.max(listener.spec.port);
    Ok((listener.spec.port..=end)
        .map(|port| PortPair::new(port, local_start + (port - listener.spec.port)))
        .collect())
}

/// Converge the accelerator's custom routing listener onto the desired runs
/// and return the listener ARN
pub async fn ensure_custom_routing(
    sdk: &AwsSdk,
    region: &str,
    accelerator_arn: &str,
    listener: &Listener,
) -> Result<String> {
    let runs = split_port_mappings(desired_port_pairs(listener)?);
    debug!(
        "accelerator {} listener '{}' wants {} port runs",
        accelerator_arn,
        listener.key(),
        runs.len()
    );

    // The accelerator must exist before anything is attached to it
    sdk.describe_custom_routing_accelerator(accelerator_arn).await?;

    let listeners = sdk.list_custom_routing_listeners(accelerator_arn).await?;
    let listener_arn = match listeners.first() {
        Some(existing) => {
            let arn = existing.listener_arn().unwrap_or_default().to_string();
            let existing_runs: Vec<AgaMappingInfo> = existing
                .port_ranges()
                .iter()
                .map(|r| AgaMappingInfo {
                    cloud_start_port: r.from_port().unwrap_or_default(),
                    cloud_end_port: r.to_port().unwrap_or_default(),
                    local_start_port: 0,
                    local_end_port: 0,
                })
                .collect();
            let cloud_side_same = existing_runs.len() == runs.len()
                && existing_runs.iter().zip(&runs).all(|(a, b)| {
                    a.cloud_start_port == b.cloud_start_port && a.cloud_end_port == b.cloud_end_port
                });
            if !cloud_side_same {
                info!("updating custom routing listener {} port ranges", arn);
                sdk.update_custom_routing_listener(&arn, &runs).await?;
            }
            arn
        }
        None => {
            info!("creating custom routing listener on {}", accelerator_arn);
            sdk.create_custom_routing_listener(accelerator_arn, &runs).await?
        }
    };

    ensure_endpoint_group(sdk, region, &listener_arn, &runs, &listener.spec.protocol).await?;
    Ok(listener_arn)
}

/// Converge the endpoint group destinations onto the local port runs
///
/// Destination port ranges are fixed at creation, so a drifted group is
/// deleted and recreated.
async fn ensure_endpoint_group(
    sdk: &AwsSdk,
    region: &str,
    listener_arn: &str,
    runs: &[AgaMappingInfo],
    protocol: &str,
) -> Result<()> {
    let groups = sdk.list_custom_routing_endpoint_groups(listener_arn).await?;
    if let Some(group) = groups.first() {
        let mut existing: Vec<AgaMappingInfo> = group
            .destination_descriptions()
            .iter()
            .map(|d| AgaMappingInfo {
                cloud_start_port: 0,
                cloud_end_port: 0,
                local_start_port: d.from_port().unwrap_or_default(),
                local_end_port: d.to_port().unwrap_or_default(),
            })
            .collect();
        existing.sort_by_key(|r| r.local_start_port);
        let local_side_same = existing.len() == runs.len()
            && existing.iter().zip(runs).all(|(a, b)| {
                a.local_start_port == b.local_start_port && a.local_end_port == b.local_end_port
            });
        if local_side_same {
            return Ok(());
        }
        let group_arn = group.endpoint_group_arn().unwrap_or_default();
        info!("recreating endpoint group {} with new destinations", group_arn);
        sdk.delete_custom_routing_endpoint_group(group_arn).await?;
    }
    sdk.create_custom_routing_endpoint_group(listener_arn, region, runs, protocol)
        .await
}

/// Remove the custom routing listener serving this segment listener
pub async fn delete_custom_routing(
    sdk: &AwsSdk,
    accelerator_arn: &str,
    listener: &Listener,
) -> Result<()> {
    let listeners = match sdk.list_custom_routing_listeners(accelerator_arn).await {
        Ok(listeners) => listeners,
        Err(err) if err.is_not_found() => {
            debug!(
                "accelerator {} already gone while deleting '{}'",
                accelerator_arn,
                listener.key()
            );
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let Some(existing) = listeners.first() else {
        return Ok(());
    };
    let listener_arn = existing.listener_arn().unwrap_or_default();

    for group in sdk.list_custom_routing_endpoint_groups(listener_arn).await? {
        sdk.delete_custom_routing_endpoint_group(group.endpoint_group_arn().unwrap_or_default())
            .await?;
    }
    sdk.delete_custom_routing_listener(listener_arn).await
}
