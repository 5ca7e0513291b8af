//! Port-segment listener expansion
//!
//! A segment listener covers the inclusive frontend range
//! `[port, end_port]`. Clouds without native port-range listeners reconcile
//! the expansion produced here: one plain listener per port, where port
//! offset `i` shifts every backend port by the same `i`.

use std::collections::HashMap;

use anyhow::anyhow;

use gantry_api::model::{Listener, ListenerResult};
use gantry_common::{CloudError, Result};

/// Whether the listener describes a port segment
pub fn is_segment(listener: &Listener) -> bool {
    listener.is_segment()
}

/// Name of the expanded listener serving `port`
pub fn expanded_name(listener: &Listener, port: i32) -> String {
    format!("{}-{}", listener.name, port)
}

/// Expand a segment listener into one plain listener per frontend port
///
/// The input is never mutated. For the listener at offset `i` the frontend
/// port and every backend port are shifted by `i`, `end_port` is cleared
/// and the name gains the frontend port as a suffix. A listener without an
/// end port expands to a single unchanged clone.
pub fn expand_segment_listener(listener: &Listener) -> Vec<Listener> {
    if !is_segment(listener) {
        return vec![listener.clone()];
    }

    let start = listener.spec.port;
    let end = listener.spec.end_port;
    let mut expanded = Vec::with_capacity((end - start + 1).max(1) as usize);
    for port in start..=end {
        let offset = port - start;
        let mut item = listener.clone();
        item.name = expanded_name(listener, port);
        item.spec.port = port;
        item.spec.end_port = 0;
        if let Some(target_group) = item.spec.target_group.as_mut() {
            for backend in &mut target_group.backends {
                backend.port += offset;
            }
        }
        expanded.push(item);
    }
    expanded
}

/// Aggregate a segment batch into one comma-joined listener id
///
/// Ids are joined in port order. Any failed expansion item fails the whole
/// segment.
pub fn segment_listener_ids_joined(
    listener: &Listener,
    results: &HashMap<String, ListenerResult>,
) -> Result<String> {
    let mut ids = Vec::new();
    for port in listener.spec.port..=listener.spec.end_port.max(listener.spec.port) {
        let name = expanded_name(listener, port);
        let result = results
            .get(&name)
            .ok_or_else(|| CloudError::Other(anyhow!("no result for expanded listener '{}'", name)))?;
        if result.is_error {
            return Err(CloudError::Operation {
                name,
                message: result.message.clone(),
            });
        }
        ids.push(result.listener_id.clone());
    }
    Ok(ids.join(","))
}

/// Return the id of the expanded listener serving the segment's first port
pub fn segment_first_listener_id(
    listener: &Listener,
    results: &HashMap<String, ListenerResult>,
) -> Result<String> {
    let name = expanded_name(listener, listener.spec.port);
    let result = results
        .get(&name)
        .ok_or_else(|| CloudError::Other(anyhow!("no result for expanded listener '{}'", name)))?;
    if result.is_error {
        return Err(CloudError::Operation {
            name,
            message: result.message.clone(),
        });
    }
    Ok(result.listener_id.clone())
}

#[cfg(test)]
mod tests {
    use gantry_api::model::{Backend, ListenerSpec, TargetGroup};

    use super::*;

    fn segment_listener() -> Listener {
        Listener::new(
            "game".to_string(),
            "default".to_string(),
            ListenerSpec {
                loadbalancer_id: "lb-1234".to_string(),
                port: 8000,
                end_port: 8002,
                protocol: "TCP".to_string(),
                target_group: Some(TargetGroup {
                    name: "tg-game".to_string(),
                    protocol: "TCP".to_string(),
                    backends: vec![Backend::new("10.0.0.1".to_string(), 9000)],
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_expand_shifts_frontend_and_backend_ports_together() {
        let listener = segment_listener();
        let expanded = expand_segment_listener(&listener);

        assert_eq!(expanded.len(), 3);
        let ports: Vec<(i32, i32)> = expanded
            .iter()
            .map(|l| {
                let backend_port = l.spec.target_group.as_ref().unwrap().backends[0].port;
                (l.spec.port, backend_port)
            })
            .collect();
        assert_eq!(ports, vec![(8000, 9000), (8001, 9001), (8002, 9002)]);

        for item in &expanded {
            assert_eq!(item.spec.end_port, 0);
            assert_eq!(item.name, format!("game-{}", item.spec.port));
        }
    }

    #[test]
    fn test_expand_does_not_mutate_the_input() {
        let listener = segment_listener();
        let _ = expand_segment_listener(&listener);

        assert_eq!(listener.name, "game");
        assert_eq!(listener.spec.end_port, 8002);
        assert_eq!(listener.spec.target_group.as_ref().unwrap().backends[0].port, 9000);
    }

    #[test]
    fn test_expand_plain_listener_is_a_clone() {
        let mut listener = segment_listener();
        listener.spec.end_port = 0;

        let expanded = expand_segment_listener(&listener);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "game");
        assert_eq!(expanded[0].spec.port, 8000);
    }

    #[test]
    fn test_expand_single_port_segment() {
        let mut listener = segment_listener();
        listener.spec.end_port = 8000;

        let expanded = expand_segment_listener(&listener);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "game-8000");
        assert_eq!(expanded[0].spec.end_port, 0);
    }

    #[test]
    fn test_joined_ids_follow_port_order() {
        let listener = segment_listener();
        let mut results = HashMap::new();
        results.insert("game-8001".to_string(), ListenerResult::ok("id-b".to_string()));
        results.insert("game-8000".to_string(), ListenerResult::ok("id-a".to_string()));
        results.insert("game-8002".to_string(), ListenerResult::ok("id-c".to_string()));

        let joined = segment_listener_ids_joined(&listener, &results).unwrap();
        assert_eq!(joined, "id-a,id-b,id-c");
    }

    #[test]
    fn test_joined_ids_fail_when_any_item_failed() {
        let listener = segment_listener();
        let mut results = HashMap::new();
        results.insert("game-8000".to_string(), ListenerResult::ok("id-a".to_string()));
        results.insert("game-8001".to_string(), ListenerResult::err("quota".to_string()));
        results.insert("game-8002".to_string(), ListenerResult::ok("id-c".to_string()));

        assert!(segment_listener_ids_joined(&listener, &results).is_err());
    }

    #[test]
    fn test_first_listener_id_matches_segment_start() {
        let listener = segment_listener();
        let mut results = HashMap::new();
        results.insert("game-8000".to_string(), ListenerResult::ok("id-a".to_string()));
        results.insert("game-8001".to_string(), ListenerResult::ok("id-b".to_string()));
        results.insert("game-8002".to_string(), ListenerResult::ok("id-c".to_string()));

        let id = segment_first_listener_id(&listener, &results).unwrap();
        assert_eq!(id, "id-a");
    }
}
