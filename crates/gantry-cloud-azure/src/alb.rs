//! Azure load balancer reconciler
//!
//! Listener protocol picks the resource family: TCP/UDP listeners land on
//! a load balancer, HTTP/HTTPS listeners on an application gateway. The
//! `loadbalancer_id` accepts a full ARM id or a bare resource name inside
//! the configured resource group.

use std::collections::HashMap;

use async_trait::async_trait;

use gantry_api::model::{BackendHealthStatus, Listener, ListenerResult, LoadBalancerObject};
use gantry_cloud::{
    DEFAULT_BATCH_CONCURRENCY, LoadBalance, delete_in_batches, ensure_in_batches,
    expand_segment_listener, segment_first_listener_id,
};
use gantry_common::error::{CloudError, Result};

use crate::appgateway;
use crate::client::ArmClient;
use crate::config::AzureConfig;
use crate::loadbalancer;
use crate::resource_id::{is_application_gateway_id, is_resource_id, resource_name};

const LB_TYPE_LOAD_BALANCER: &str = "loadBalancer";
const LB_TYPE_APPLICATION_GATEWAY: &str = "applicationGateway";

/// Azure implementation of the [`LoadBalance`] capability
pub struct AzureAlb {
    client: ArmClient,
}

impl AzureAlb {
    pub fn new(config: AzureConfig) -> Result<Self> {
        Ok(Self { client: ArmClient::new(config)? })
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self { client: ArmClient::from_env()? })
    }

    async fn ensure_plain_listener(&self, listener: &Listener) -> Result<String> {
        if listener.is_layer7() {
            appgateway::ensure(&self.client, listener).await
        } else {
            loadbalancer::ensure(&self.client, listener).await
        }
    }

    async fn delete_plain_listener(&self, listener: &Listener) -> Result<()> {
        if listener.is_layer7() {
            appgateway::delete(&self.client, listener).await
        } else {
            loadbalancer::delete(&self.client, listener).await
        }
    }

    async fn describe_l4(&self, region: &str, target: &str) -> Result<LoadBalancerObject> {
        let id = self.client.load_balancer_id(target)?;
        let lb = self.client.get_load_balancer(&id).await.map_err(|err| {
            if err.is_not_found() {
                CloudError::LoadBalancerNotFound(target.to_string())
            } else {
                err
            }
        })?;
        Ok(LoadBalancerObject {
            lb_id: lb.id.unwrap_or(id),
            region: lb.location.unwrap_or_else(|| region.to_string()),
            name: lb.name.unwrap_or_else(|| resource_name(target).to_string()),
            lb_type: LB_TYPE_LOAD_BALANCER.to_string(),
            ..Default::default()
        })
    }

    async fn describe_l7(&self, region: &str, target: &str) -> Result<LoadBalancerObject> {
        let id = self.client.application_gateway_id(target)?;
        let gateway = self.client.get_application_gateway(&id).await.map_err(|err| {
            if err.is_not_found() {
                CloudError::LoadBalancerNotFound(target.to_string())
            } else {
                err
            }
        })?;
        Ok(LoadBalancerObject {
            lb_id: gateway.id.unwrap_or(id),
            region: gateway.location.unwrap_or_else(|| region.to_string()),
            name: gateway.name.unwrap_or_else(|| resource_name(target).to_string()),
            lb_type: LB_TYPE_APPLICATION_GATEWAY.to_string(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl LoadBalance for AzureAlb {
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
        if is_application_gateway_id(target) {
            return self.describe_l7(region, target).await;
        }
        match self.describe_l4(region, target).await {
            // A bare name may refer to an application gateway instead
            Err(err) if err.is_not_found() && !is_resource_id(target) => {
                self.describe_l7(region, target).await
            }
            other => other,
        }
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

    /// Backend health is only observable for application gateways; the load
    /// balancer API exposes no per-backend probe results
    async fn describe_backend_status(
        &self,
        _region: &str,
        _namespace: &str,
        lb_ids: &[String],
    ) -> Result<HashMap<String, Vec<BackendHealthStatus>>> {
        let mut result = HashMap::new();
        for lb_id in lb_ids {
            let statuses = if is_resource_id(lb_id) && !is_application_gateway_id(lb_id) {
                Vec::new()
            } else {
                match appgateway::backend_status(&self.client, lb_id).await {
                    Ok(statuses) => statuses,
                    Err(err) if err.is_not_found() => Vec::new(),
                    Err(err) => return Err(err),
                }
            };
            result.insert(lb_id.clone(), statuses);
        }
        Ok(result)
    }
}
