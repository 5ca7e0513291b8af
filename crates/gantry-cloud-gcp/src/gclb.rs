//! GCP load balancer reconciler
//!
//! Listener protocol picks the resource family: TCP/UDP listeners become
//! Kubernetes Services of type LoadBalancer reconciled by the in-cluster
//! cloud provider, HTTP/HTTPS listeners a global forwarding rule chain
//! driven through the compute API. Load balancer ids therefore come in
//! two shapes: `namespace/name` of a Service, or the name or link of a
//! global forwarding rule.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;

use gantry_api::model::{BackendHealthStatus, Listener, ListenerResult, LoadBalancerObject};
use gantry_cloud::{
    DEFAULT_BATCH_CONCURRENCY, LoadBalance, delete_in_batches, ensure_in_batches,
    expand_segment_listener, segment_first_listener_id,
};
use gantry_common::error::{CloudError, Result};

use crate::client::ComputeClient;
use crate::config::GcpConfig;
use crate::link::{is_ip_address, is_self_link, resource_name};
use crate::topology::kube_error;
use crate::{l4, l7};

const LB_TYPE_SERVICE: &str = "service";
const LB_TYPE_FORWARDING_RULE: &str = "forwardingRule";

/// GCP implementation of the [`LoadBalance`] capability
pub struct GcpGclb {
    client: ComputeClient,
    kube: kube::Client,
    namespace: String,
}

impl GcpGclb {
    /// Build a reconciler serving one namespace. The kube client follows
    /// the in-cluster config, or the local kubeconfig outside a cluster.
    pub async fn new(config: GcpConfig, namespace: impl Into<String>) -> Result<Self> {
        let client = ComputeClient::new(config)?;
        let kube = kube::Client::try_default()
            .await
            .map_err(|err| CloudError::Config(format!("building kubernetes client: {err}")))?;
        Ok(Self { client, kube, namespace: namespace.into() })
    }

    pub async fn from_env(namespace: impl Into<String>) -> Result<Self> {
        Self::new(GcpConfig::from_env(), namespace).await
    }

    async fn ensure_plain_listener(&self, listener: &Listener) -> Result<String> {
        if listener.is_layer7() {
            l7::ensure(&self.client, &self.kube, listener).await
        } else {
            l4::ensure(&self.kube, listener).await
        }
    }

    async fn delete_plain_listener(&self, listener: &Listener) -> Result<()> {
        if listener.is_layer7() {
            l7::delete(&self.client, listener).await
        } else {
            l4::delete(&self.kube, listener).await
        }
    }

    async fn describe_service(
        &self,
        region: &str,
        target: &str,
        namespace: &str,
        name: &str,
    ) -> Result<LoadBalancerObject> {
        let api: Api<Service> = Api::namespaced(self.kube.clone(), namespace);
        let Some(service) =
            api.get_opt(name).await.map_err(|err| kube_error("services", name, err))?
        else {
            return Err(CloudError::LoadBalancerNotFound(target.to_string()));
        };
        let ingress = service
            .status
            .as_ref()
            .and_then(|status| status.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|entries| entries.first());
        let ip_address = ingress
            .and_then(|entry| entry.ip.clone())
            .or_else(|| service.spec.as_ref().and_then(|spec| spec.load_balancer_ip.clone()));
        Ok(LoadBalancerObject {
            lb_id: target.to_string(),
            region: region.to_string(),
            name: name.to_string(),
            lb_type: LB_TYPE_SERVICE.to_string(),
            ip_address,
            dns_name: ingress.and_then(|entry| entry.hostname.clone()),
            ..Default::default()
        })
    }
}

/// Whether a target names a Service as `namespace/name`
fn service_ref(target: &str) -> Option<(&str, &str)> {
    if is_self_link(target) {
        return None;
    }
    let (namespace, name) = target.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

#[async_trait]
impl LoadBalance for GcpGclb {
    async fn describe_load_balancer(
        &self,
        region: &str,
        lb_id: &str,
        name: &str,
    ) -> Result<LoadBalancerObject> {
        let target = if lb_id.is_empty() { name } else { lb_id };
        if target.is_empty() {
            return Err(CloudError::Validation(
                "load balancer id or name is required".to_string(),
            ));
        }
        if let Some((namespace, service_name)) = service_ref(target) {
            return self.describe_service(region, target, namespace, service_name).await;
        }
        let Some(rule) = self.client.get_forwarding_rule(resource_name(target)).await? else {
            return Err(CloudError::LoadBalancerNotFound(target.to_string()));
        };
        Ok(LoadBalancerObject {
            lb_id: rule
                .self_link
                .clone()
                .unwrap_or_else(|| self.client.global_link("forwardingRules", &rule.name)),
            region: region.to_string(),
            name: rule.name.clone(),
            lb_type: LB_TYPE_FORWARDING_RULE.to_string(),
            scheme: rule.load_balancing_scheme.clone(),
            ip_address: rule.ip_address.clone(),
            ..Default::default()
        })
    }

    async fn ensure_listener(&self, region: &str, listener: &Listener) -> Result<String> {
        if listener.is_segment() {
            return self.ensure_segment_listener(region, listener).await;
        }
        self.ensure_plain_listener(listener).await
    }

    async fn delete_listener(&self, region: &str, listener: &Listener) -> Result<()> {
        if listener.is_segment() {
            return self.delete_segment_listener(region, listener).await;
        }
        self.delete_plain_listener(listener).await
    }

    async fn ensure_multi_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>> {
        Ok(ensure_in_batches(listeners, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            self.ensure_listener(region, &listener).await
        })
        .await)
    }

    async fn delete_multi_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>> {
        Ok(delete_in_batches(listeners, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            self.delete_listener(region, &listener).await
        })
        .await)
    }

    async fn ensure_segment_listener(&self, region: &str, listener: &Listener) -> Result<String> {
        if !listener.is_segment() {
            return self.ensure_plain_listener(listener).await;
        }
        let expanded = expand_segment_listener(listener);
        let results = self.ensure_multi_listeners(region, &expanded).await?;
        segment_first_listener_id(listener, &results)
    }

    async fn ensure_multi_segment_listeners(
        &self,
        region: &str,
        listeners: &[Listener],
    ) -> Result<HashMap<String, ListenerResult>> {
        Ok(ensure_in_batches(listeners, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            self.ensure_segment_listener(region, &listener).await
        })
        .await)
    }

    async fn delete_segment_listener(&self, region: &str, listener: &Listener) -> Result<()> {
        if !listener.is_segment() {
            return self.delete_plain_listener(listener).await;
        }
        let expanded = expand_segment_listener(listener);
        let results = self.delete_multi_listeners(region, &expanded).await?;
        for (name, result) in &results {
            if result.is_error {
                return Err(CloudError::Operation {
                    name: name.clone(),
                    message: result.message.clone(),
                });
            }
        }
        Ok(())
    }

    async fn describe_backend_status(
        &self,
        _region: &str,
        namespace: &str,
        lb_ids: &[String],
    ) -> Result<HashMap<String, Vec<BackendHealthStatus>>> {
        let namespace = if namespace.is_empty() { self.namespace.as_str() } else { namespace };
        let mut result = HashMap::new();
        for lb_id in lb_ids {
            let statuses = if let Some((service_namespace, name)) = service_ref(lb_id) {
                l4::backend_status_by_name(&self.kube, service_namespace, name).await?
            } else if is_ip_address(lb_id) {
                l4::backend_status(&self.kube, namespace, lb_id).await?
            } else {
                match l7::backend_status(&self.client, lb_id).await {
                    Ok(statuses) => statuses,
                    Err(err) if err.is_not_found() => Vec::new(),
                    Err(err) => return Err(err),
                }
            };
            result.insert(lb_id.clone(), statuses);
        }
        Ok(result)
    }

    /// Services live in namespaces, so one reconciler serves one namespace
    fn is_namespaced(&self) -> bool {
        true
    }
}
