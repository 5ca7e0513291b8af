//! Backend membership diffing
//!
//! Reconcilers converge backend pools by computing set differences keyed by
//! `(ip, port)` and issuing only the missing registrations and the stale
//! deregistrations. Backends present on both sides are left untouched.

use std::collections::HashSet;

use gantry_api::model::Backend;

/// Split desired vs. existing backends into additions and removals
///
/// Returns `(to_add, to_del)`. Identity is `(ip, port)`; metadata like
/// weight does not make a backend "different".
pub fn diff_backends(existing: &[Backend], desired: &[Backend]) -> (Vec<Backend>, Vec<Backend>) {
    let existing_keys: HashSet<(String, i32)> =
        existing.iter().map(|b| (b.ip.clone(), b.port)).collect();
    let desired_keys: HashSet<(String, i32)> =
        desired.iter().map(|b| (b.ip.clone(), b.port)).collect();

    let to_add = desired
        .iter()
        .filter(|b| !existing_keys.contains(&(b.ip.clone(), b.port)))
        .cloned()
        .collect();
    let to_del = existing
        .iter()
        .filter(|b| !desired_keys.contains(&(b.ip.clone(), b.port)))
        .cloned()
        .collect();
    (to_add, to_del)
}
