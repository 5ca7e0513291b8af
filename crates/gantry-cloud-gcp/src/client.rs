//! Compute v1 REST client
//!
//! Thin HTTP layer over the compute API: service account bearer tokens,
//! client-side rate limiting, call metrics, and the operation wait cycle
//! every compute mutation goes through.
//!
//! Mutating wrappers block until their [`Operation`] reaches `DONE`: the
//! poll endpoint is picked by which scope field the operation carries
//! (zone, region or neither), polled every [`POLL_INTERVAL`] with the
//! whole wait bounded by the configured per-operation timeout. An error
//! embedded in a finished operation is always fatal; callers retry by
//! running the ensure again.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use gantry_common::error::{CloudError, Result};
use gantry_common::metrics::{ApiTimer, CloudMetrics, global};
use gantry_common::ratelimit::RateLimiter;

use crate::config::{GcpConfig, ServiceAccountKey};
use crate::link::{region_of, resource_name, zone_of};
use crate::model::{
    BackendService, BackendServiceGroupHealth, ForwardingRule, GoogleErrorResponse, HealthCheck,
    ListResponse, NetworkEndpointGroup, NetworkEndpointWithHealth, NetworkEndpointsRequest,
    Operation, ResourceGroupReference, SslCertificatesRequest, TargetHttpProxy, TargetHttpsProxy,
    TargetReference, UrlMap, UrlMapReference,
};
use crate::token::TokenProvider;

/// API endpoint; also the prefix of every self link the API returns
pub const COMPUTE_ENDPOINT: &str = "https://www.googleapis.com/compute/v1";

const CLOUD_LABEL: &str = "gcp";

/// Interval between polls of a running operation
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Error reasons that mean "try the same call again shortly"
const RETRYABLE_REASONS: [&str; 3] =
    ["rateLimitExceeded", "userRateLimitExceeded", "resourceNotReady"];

pub struct ComputeClient {
    http: reqwest::Client,
    config: GcpConfig,
    project: String,
    token: TokenProvider,
    limiter: RateLimiter,
    metrics: &'static CloudMetrics,
}

impl ComputeClient {
    pub fn new(config: GcpConfig) -> Result<Self> {
        config.validate()?;
        let key = ServiceAccountKey::from_file(&config.credentials_path)?;
        let project = config.resolve_project(&key)?;
        let token = TokenProvider::new(key)?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| CloudError::Config(format!("building http client: {err}")))?;
        let limiter = RateLimiter::new(config.ratelimit_bucket_size, config.ratelimit_qps as f64);
        Ok(Self { http, project, token, limiter, metrics: global(), config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(GcpConfig::from_env())
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.operation_timeout_secs)
    }

    /// Full link of a global resource
    pub fn global_link(&self, collection: &str, name: &str) -> String {
        format!("{}/projects/{}/global/{}/{}", COMPUTE_ENDPOINT, self.project, collection, name)
    }

    /// Full link of a zonal resource
    pub fn zonal_link(&self, zone: &str, collection: &str, name: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}/{}",
            COMPUTE_ENDPOINT, self.project, zone, collection, name
        )
    }

    fn global_url(&self, collection: &str) -> String {
        format!("{}/projects/{}/global/{}", COMPUTE_ENDPOINT, self.project, collection)
    }

    fn zonal_url(&self, zone: &str, collection: &str) -> String {
        format!("{}/projects/{}/zones/{}/{}", COMPUTE_ENDPOINT, self.project, zone, collection)
    }

    /// Attach auth and send; transport failures become [`CloudError::Network`]
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.token.bearer_token(&self.http).await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| CloudError::Network(err.to_string()))
    }

    /// One metered, rate-limited request with a decoded JSON answer
    async fn request<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        kind: &str,
        name: &str,
        operation: &str,
    ) -> Result<T> {
        match self.request_opt(builder, kind, name, operation, false).await? {
            Some(value) => Ok(value),
            // Unreachable: tolerate_missing was false
            None => Err(CloudError::not_found(kind, name)),
        }
    }

    /// Like [`ComputeClient::request`] but a 404 answer becomes `Ok(None)`
    /// when `tolerate_missing` is set
    async fn request_opt<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        kind: &str,
        name: &str,
        operation: &str,
        tolerate_missing: bool,
    ) -> Result<Option<T>> {
        self.limiter.acquire().await;
        let timer = ApiTimer::start(self.metrics, CLOUD_LABEL, operation);
        let response = match self.send(builder).await {
            Ok(response) => response,
            Err(err) => {
                timer.failure(err.label());
                return Err(err);
            }
        };
        let status = response.status();
        if status == StatusCode::NOT_FOUND && tolerate_missing {
            timer.success();
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify(status, &body, kind, name, operation);
            timer.failure(err.label());
            return Err(err);
        }
        match response.json::<T>().await {
            Ok(value) => {
                timer.success();
                Ok(Some(value))
            }
            Err(err) => {
                let err = CloudError::Other(anyhow::anyhow!("decoding {operation} response: {err}"));
                timer.failure(err.label());
                Err(err)
            }
        }
    }

    /// Run one mutation to completion: issue it, then wait for the
    /// returned operation
    async fn mutate(
        &self,
        builder: reqwest::RequestBuilder,
        kind: &str,
        name: &str,
        operation: &str,
    ) -> Result<()> {
        let op: Operation = self.request(builder, kind, name, operation).await?;
        self.wait(op, operation).await
    }

    /// Like [`ComputeClient::mutate`] but a missing resource is success;
    /// used by the delete wrappers
    async fn mutate_missing_ok(
        &self,
        builder: reqwest::RequestBuilder,
        kind: &str,
        name: &str,
        operation: &str,
    ) -> Result<()> {
        match self.request_opt::<Operation>(builder, kind, name, operation, true).await? {
            Some(op) => self.wait(op, operation).await,
            None => {
                debug!(kind, name, "already absent");
                Ok(())
            }
        }
    }

    /// Poll an operation every [`POLL_INTERVAL`] until `DONE`, under the
    /// per-operation timeout. The poll endpoint follows the operation
    /// scope: zonal and regional operations name their scope, global ones
    /// name neither.
    pub async fn wait(&self, operation: Operation, context: &str) -> Result<()> {
        let timeout = self.operation_timeout();
        tokio::time::timeout(timeout, self.poll_until_done(operation))
            .await
            .map_err(|_| CloudError::Timeout(timeout, context.to_string()))?
    }

    async fn poll_until_done(&self, mut operation: Operation) -> Result<()> {
        let url = operation_url(&self.project, &operation);
        loop {
            if operation.is_done() {
                return match operation.error_message() {
                    Some(message) => {
                        Err(CloudError::Operation { name: operation.name.clone(), message })
                    }
                    None => Ok(()),
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            self.limiter.acquire().await;
            let response = self.send(self.http.get(&url)).await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(classify(status, &body, "operations", &operation.name, "WaitOperation"));
            }
            operation = serde_json::from_str(&body).map_err(|err| {
                CloudError::Other(anyhow::anyhow!("decoding operation {}: {err}", operation.name))
            })?;
        }
    }

    // Health checks

    pub async fn get_health_check(&self, name: &str) -> Result<Option<HealthCheck>> {
        let url = format!("{}/{}", self.global_url("healthChecks"), name);
        self.request_opt(self.http.get(url), "healthChecks", name, "GetHealthCheck", true).await
    }

    pub async fn insert_health_check(&self, check: &HealthCheck) -> Result<()> {
        let url = self.global_url("healthChecks");
        self.mutate(self.http.post(url).json(check), "healthChecks", &check.name, "InsertHealthCheck")
            .await
    }

    pub async fn update_health_check(&self, check: &HealthCheck) -> Result<()> {
        let url = format!("{}/{}", self.global_url("healthChecks"), check.name);
        self.mutate(self.http.put(url).json(check), "healthChecks", &check.name, "UpdateHealthCheck")
            .await
    }

    pub async fn delete_health_check(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.global_url("healthChecks"), name);
        self.mutate_missing_ok(self.http.delete(url), "healthChecks", name, "DeleteHealthCheck")
            .await
    }

    // Backend services

    pub async fn get_backend_service(&self, name: &str) -> Result<Option<BackendService>> {
        let url = format!("{}/{}", self.global_url("backendServices"), name);
        self.request_opt(self.http.get(url), "backendServices", name, "GetBackendService", true)
            .await
    }

    pub async fn insert_backend_service(&self, service: &BackendService) -> Result<()> {
        let url = self.global_url("backendServices");
        self.mutate(
            self.http.post(url).json(service),
            "backendServices",
            &service.name,
            "InsertBackendService",
        )
        .await
    }

    pub async fn update_backend_service(&self, service: &BackendService) -> Result<()> {
        let url = format!("{}/{}", self.global_url("backendServices"), service.name);
        self.mutate(
            self.http.put(url).json(service),
            "backendServices",
            &service.name,
            "UpdateBackendService",
        )
        .await
    }

    pub async fn delete_backend_service(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.global_url("backendServices"), name);
        self.mutate_missing_ok(self.http.delete(url), "backendServices", name, "DeleteBackendService")
            .await
    }

    /// Health of every endpoint one backend group contributes to a service
    pub async fn backend_service_health(
        &self,
        name: &str,
        group: &str,
    ) -> Result<BackendServiceGroupHealth> {
        let url = format!("{}/{}/getHealth", self.global_url("backendServices"), name);
        let body = ResourceGroupReference { group: group.to_string() };
        self.request(self.http.post(url).json(&body), "backendServices", name, "GetBackendHealth")
            .await
    }

    // Network endpoint groups

    pub async fn get_network_endpoint_group(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<Option<NetworkEndpointGroup>> {
        let url = format!("{}/{}", self.zonal_url(zone, "networkEndpointGroups"), name);
        self.request_opt(self.http.get(url), "networkEndpointGroups", name, "GetEndpointGroup", true)
            .await
    }

    pub async fn insert_network_endpoint_group(
        &self,
        zone: &str,
        neg: &NetworkEndpointGroup,
    ) -> Result<()> {
        let url = self.zonal_url(zone, "networkEndpointGroups");
        self.mutate(
            self.http.post(url).json(neg),
            "networkEndpointGroups",
            &neg.name,
            "InsertEndpointGroup",
        )
        .await
    }

    pub async fn delete_network_endpoint_group(&self, zone: &str, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.zonal_url(zone, "networkEndpointGroups"), name);
        self.mutate_missing_ok(
            self.http.delete(url),
            "networkEndpointGroups",
            name,
            "DeleteEndpointGroup",
        )
        .await
    }

    /// Current endpoint membership of a zonal group, all pages
    pub async fn list_network_endpoints(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<Vec<NetworkEndpointWithHealth>> {
        let url = format!(
            "{}/{}/listNetworkEndpoints",
            self.zonal_url(zone, "networkEndpointGroups"),
            name
        );
        let mut endpoints = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut builder = self.http.post(&url).json(&serde_json::json!({}));
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token.as_str())]);
            }
            let page: ListResponse<NetworkEndpointWithHealth> = self
                .request(builder, "networkEndpointGroups", name, "ListNetworkEndpoints")
                .await?;
            endpoints.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(endpoints),
            }
        }
    }

    pub async fn attach_network_endpoints(
        &self,
        zone: &str,
        name: &str,
        request: &NetworkEndpointsRequest,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/attachNetworkEndpoints",
            self.zonal_url(zone, "networkEndpointGroups"),
            name
        );
        self.mutate(
            self.http.post(url).json(request),
            "networkEndpointGroups",
            name,
            "AttachNetworkEndpoints",
        )
        .await
    }

    pub async fn detach_network_endpoints(
        &self,
        zone: &str,
        name: &str,
        request: &NetworkEndpointsRequest,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/detachNetworkEndpoints",
            self.zonal_url(zone, "networkEndpointGroups"),
            name
        );
        self.mutate(
            self.http.post(url).json(request),
            "networkEndpointGroups",
            name,
            "DetachNetworkEndpoints",
        )
        .await
    }

    // URL maps

    pub async fn get_url_map(&self, name: &str) -> Result<Option<UrlMap>> {
        let url = format!("{}/{}", self.global_url("urlMaps"), name);
        self.request_opt(self.http.get(url), "urlMaps", name, "GetUrlMap", true).await
    }

    pub async fn insert_url_map(&self, map: &UrlMap) -> Result<()> {
        let url = self.global_url("urlMaps");
        self.mutate(self.http.post(url).json(map), "urlMaps", &map.name, "InsertUrlMap").await
    }

    pub async fn update_url_map(&self, map: &UrlMap) -> Result<()> {
        let url = format!("{}/{}", self.global_url("urlMaps"), map.name);
        self.mutate(self.http.put(url).json(map), "urlMaps", &map.name, "UpdateUrlMap").await
    }

    pub async fn delete_url_map(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.global_url("urlMaps"), name);
        self.mutate_missing_ok(self.http.delete(url), "urlMaps", name, "DeleteUrlMap").await
    }

    // Target proxies

    pub async fn get_target_http_proxy(&self, name: &str) -> Result<Option<TargetHttpProxy>> {
        let url = format!("{}/{}", self.global_url("targetHttpProxies"), name);
        self.request_opt(self.http.get(url), "targetHttpProxies", name, "GetTargetProxy", true)
            .await
    }

    pub async fn insert_target_http_proxy(&self, proxy: &TargetHttpProxy) -> Result<()> {
        let url = self.global_url("targetHttpProxies");
        self.mutate(
            self.http.post(url).json(proxy),
            "targetHttpProxies",
            &proxy.name,
            "InsertTargetProxy",
        )
        .await
    }

    pub async fn set_target_http_proxy_url_map(&self, name: &str, url_map: &str) -> Result<()> {
        let url = format!("{}/{}/setUrlMap", self.global_url("targetHttpProxies"), name);
        let body = UrlMapReference { url_map: url_map.to_string() };
        self.mutate(self.http.post(url).json(&body), "targetHttpProxies", name, "SetUrlMap").await
    }

    pub async fn delete_target_http_proxy(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.global_url("targetHttpProxies"), name);
        self.mutate_missing_ok(self.http.delete(url), "targetHttpProxies", name, "DeleteTargetProxy")
            .await
    }

    pub async fn get_target_https_proxy(&self, name: &str) -> Result<Option<TargetHttpsProxy>> {
        let url = format!("{}/{}", self.global_url("targetHttpsProxies"), name);
        self.request_opt(self.http.get(url), "targetHttpsProxies", name, "GetTargetProxy", true)
            .await
    }

    pub async fn insert_target_https_proxy(&self, proxy: &TargetHttpsProxy) -> Result<()> {
        let url = self.global_url("targetHttpsProxies");
        self.mutate(
            self.http.post(url).json(proxy),
            "targetHttpsProxies",
            &proxy.name,
            "InsertTargetProxy",
        )
        .await
    }

    pub async fn set_target_https_proxy_url_map(&self, name: &str, url_map: &str) -> Result<()> {
        let url = format!("{}/{}/setUrlMap", self.global_url("targetHttpsProxies"), name);
        let body = UrlMapReference { url_map: url_map.to_string() };
        self.mutate(self.http.post(url).json(&body), "targetHttpsProxies", name, "SetUrlMap").await
    }

    pub async fn set_target_https_proxy_certificates(
        &self,
        name: &str,
        certificates: Vec<String>,
    ) -> Result<()> {
        let url =
            format!("{}/{}/setSslCertificates", self.global_url("targetHttpsProxies"), name);
        let body = SslCertificatesRequest { ssl_certificates: certificates };
        self.mutate(self.http.post(url).json(&body), "targetHttpsProxies", name, "SetSslCertificates")
            .await
    }

    pub async fn delete_target_https_proxy(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.global_url("targetHttpsProxies"), name);
        self.mutate_missing_ok(self.http.delete(url), "targetHttpsProxies", name, "DeleteTargetProxy")
            .await
    }

    // Global forwarding rules

    pub async fn get_forwarding_rule(&self, name: &str) -> Result<Option<ForwardingRule>> {
        let url = format!("{}/{}", self.global_url("forwardingRules"), name);
        self.request_opt(self.http.get(url), "forwardingRules", name, "GetForwardingRule", true)
            .await
    }

    pub async fn insert_forwarding_rule(&self, rule: &ForwardingRule) -> Result<()> {
        let url = self.global_url("forwardingRules");
        self.mutate(
            self.http.post(url).json(rule),
            "forwardingRules",
            &rule.name,
            "InsertForwardingRule",
        )
        .await
    }

    pub async fn set_forwarding_rule_target(&self, name: &str, target: &str) -> Result<()> {
        let url = format!("{}/{}/setTarget", self.global_url("forwardingRules"), name);
        let body = TargetReference { target: target.to_string() };
        self.mutate(self.http.post(url).json(&body), "forwardingRules", name, "SetTarget").await
    }

    pub async fn delete_forwarding_rule(&self, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.global_url("forwardingRules"), name);
        self.mutate_missing_ok(self.http.delete(url), "forwardingRules", name, "DeleteForwardingRule")
            .await
    }

    // Instances

    pub async fn get_instance(&self, zone: &str, name: &str) -> Result<crate::model::Instance> {
        let url = format!("{}/{}", self.zonal_url(zone, "instances"), name);
        self.request(self.http.get(url), "instances", name, "GetInstance").await
    }
}

/// Poll endpoint of an operation, picked by its scope fields
fn operation_url(project: &str, operation: &Operation) -> String {
    if let Some(zone) = operation.zone.as_deref().and_then(zone_of) {
        return format!(
            "{}/projects/{}/zones/{}/operations/{}",
            COMPUTE_ENDPOINT, project, zone, operation.name
        );
    }
    if let Some(region) = operation.region.as_deref().and_then(region_of) {
        return format!(
            "{}/projects/{}/regions/{}/operations/{}",
            COMPUTE_ENDPOINT, project, region, operation.name
        );
    }
    format!("{}/projects/{}/global/operations/{}", COMPUTE_ENDPOINT, project, operation.name)
}

/// Map a failed compute response onto the error taxonomy
fn classify(
    status: StatusCode,
    body: &str,
    kind: &str,
    name: &str,
    operation: &str,
) -> CloudError {
    let parsed: GoogleErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let reason = parsed.reason();
    let message = if parsed.message().is_empty() {
        format!("status {}", status.as_u16())
    } else {
        parsed.message().to_string()
    };

    if status == StatusCode::NOT_FOUND {
        return CloudError::not_found(kind, resource_name(name));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || RETRYABLE_REASONS.contains(&reason) {
        return CloudError::Retryable(message);
    }
    CloudError::Operation { name: operation.to_string(), message }
}
