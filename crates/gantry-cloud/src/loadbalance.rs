//! Cloud load balancer capability trait

use std::collections::HashMap;

use async_trait::async_trait;

use gantry_api::model::{BackendHealthStatus, Listener, ListenerResult, LoadBalancerObject};
use gantry_common::Result;

/// Load balancer abstraction trait
///
/// All cloud reconcilers (AWS, Azure, GCP) implement this trait to provide
/// a unified interface for listener management. Every operation is
/// idempotent: ensure converges cloud state toward the listener description
/// and delete treats missing resources as success, so callers retry simply
/// by calling again.
#[async_trait]
pub trait LoadBalance: Send + Sync {
    /// Fetch the load balancer and return its normalized attributes
    ///
    /// `lb_id` takes precedence; `name` is used when the id is empty. A
    /// missing load balancer yields
    /// [`CloudError::LoadBalancerNotFound`](gantry_common::CloudError::LoadBalancerNotFound).
    async fn describe_load_balancer(
        &self,
        region: &str,
        lb_id: &str,
        name: &str,
    ) -> Result<LoadBalancerObject>;

    /// Converge one listener and return its provider listener id
    async fn ensure_listener(&self, region: &str, listener: &Listener) -> Result<String>;

    /// Remove one listener together with the resources it owns
    async fn delete_listener(&self, region: &str, listener: &Listener) -> Result<()>;

    /// Converge a batch of listeners with per-listener isolation
    ///
    /// The returned map is keyed by listener name. One listener's failure
    /// never aborts the rest of the batch.
    async fn ensure_multi_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>>;

    /// Remove a batch of listeners with per-listener isolation
    async fn delete_multi_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>>;

    /// Converge a port-segment listener covering `[port, end_port]`
    async fn ensure_segment_listener(&self, region: &str, listener: &Listener) -> Result<String>;

    /// Converge a batch of port-segment listeners
    async fn ensure_multi_segment_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>>;

    /// Remove a port-segment listener and everything it expanded into
    async fn delete_segment_listener(&self, region: &str, listener: &Listener) -> Result<()>;

    /// Backend health per load balancer id
    async fn describe_backend_status(
        &self,
        region: &str,
        namespace: &str,
        lb_ids: &[String],
    ) -> Result<HashMap<String, Vec<BackendHealthStatus>>>;

    /// Whether listener resources live inside a namespace scope
    ///
    /// True only for clouds that materialize listeners as in-cluster
    /// objects; callers then pass a meaningful namespace to
    /// `describe_backend_status`.
    fn is_namespaced(&self) -> bool {
        false
    }
}
