//! Gantry Cloud - load balancer capability trait and shared helpers
//!
//! This crate provides:
//! - The [`LoadBalance`] trait implemented by every cloud reconciler
//! - Port-segment expansion shared by clouds without native range listeners
//! - Backend membership diffing
//! - Bounded-concurrency batch execution with per-listener isolation

pub mod batch;
pub mod diff;
pub mod loadbalance;
pub mod segment;

// Re-export commonly used items
pub use batch::{DEFAULT_BATCH_CONCURRENCY, delete_in_batches, ensure_in_batches};
pub use diff::diff_backends;
pub use loadbalance::LoadBalance;
pub use segment::{
    expand_segment_listener, expanded_name, is_segment, segment_first_listener_id,
    segment_listener_ids_joined,
};
