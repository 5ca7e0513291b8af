//! Azure Resource Manager client
//!
//! Thin HTTP layer over the ARM network API: client-credentials tokens per
//! service principal, client-side rate limiting, call metrics, and the
//! begin-then-poll cycle ARM uses for every mutation.
//!
//! Mutations go through [`ArmClient::put_load_balancer`] and
//! [`ArmClient::put_application_gateway`]: the ARM network API accepts a
//! whole-resource PUT, so a reconcile pass reads the resource, rewrites the
//! sub-resource arrays it owns and writes the result back in one operation.
//! ARM serializes writes per resource; while another writer holds the
//! resource the begin call fails with a retryable code and is re-issued
//! after [`WAIT_PERIOD_LB_DEALING`], up to [`MAX_RETRY`] times.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use gantry_common::error::{CloudError, Result};
use gantry_common::metrics::{ApiTimer, CloudMetrics, global};
use gantry_common::ratelimit::RateLimiter;

use crate::armmodel::{
    ApplicationGateway, ApplicationGatewayBackendHealth, ArmErrorResponse, ArmOperation,
    LoadBalancer, OPERATION_STATUS_SUCCEEDED,
};
use crate::config::{AzureConfig, AzureCredential};
use crate::resource_id::{
    KIND_APPLICATION_GATEWAYS, KIND_LOAD_BALANCERS, KIND_VIRTUAL_NETWORKS, is_application_gateway_id,
    is_resource_id, network_resource_id, resource_name,
};

pub const ARM_ENDPOINT: &str = "https://management.azure.com";
pub const AAD_ENDPOINT: &str = "https://login.microsoftonline.com";
pub const ARM_SCOPE: &str = "https://management.azure.com/.default";
pub const NETWORK_API_VERSION: &str = "2023-05-01";

const CLOUD_LABEL: &str = "azure";

/// Pause before re-issuing a begin call the management plane rejected
/// because another operation holds the resource
pub const WAIT_PERIOD_LB_DEALING: Duration = Duration::from_secs(2);
/// Interval between polls of a running operation
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on begin attempts for one mutation
pub const MAX_RETRY: u32 = 25;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// ARM error codes that mean "try the same call again shortly"
const RETRYABLE_ARM_CODES: [&str; 2] = ["RetryableError", "AnotherOperationInProgress"];

#[derive(Clone)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub struct ArmClient {
    http: reqwest::Client,
    config: AzureConfig,
    /// Round-robin cursor over `config.credentials`
    credential_index: AtomicUsize,
    /// Cached AAD tokens keyed by client id
    tokens: DashMap<String, TokenInfo>,
    limiter: RateLimiter,
    metrics: &'static CloudMetrics,
}

impl ArmClient {
    pub fn new(config: AzureConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| CloudError::Config(format!("building http client: {err}")))?;
        let limiter = RateLimiter::new(config.ratelimit_bucket_size, config.ratelimit_qps as f64);
        Ok(Self {
            http,
            credential_index: AtomicUsize::new(0),
            tokens: DashMap::new(),
            limiter,
            metrics: global(),
            config,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(AzureConfig::from_env())
    }

    /// Next credential in round-robin order. Rotating over several service
    /// principals spreads the per-principal ARM request quota.
    fn credential(&self) -> Result<&AzureCredential> {
        if self.config.credentials.is_empty() {
            return Err(CloudError::Config("no Azure credentials configured".to_string()));
        }
        let index = self.credential_index.fetch_add(1, Ordering::Relaxed);
        Ok(&self.config.credentials[index % self.config.credentials.len()])
    }

    /// All credentials act on one subscription; resource paths are built
    /// from the first one.
    fn subscription_id(&self) -> Result<&str> {
        self.config
            .credentials
            .first()
            .map(|credential| credential.subscription_id.as_str())
            .ok_or_else(|| CloudError::Config("no Azure credentials configured".to_string()))
    }

    /// Expand a bare load balancer name into a full ARM id
    pub fn load_balancer_id(&self, lb_id: &str) -> Result<String> {
        if is_resource_id(lb_id) {
            return Ok(lb_id.to_string());
        }
        Ok(network_resource_id(
            self.subscription_id()?,
            &self.config.resource_group,
            KIND_LOAD_BALANCERS,
            lb_id,
        ))
    }

    /// Expand a bare application gateway name into a full ARM id
    pub fn application_gateway_id(&self, lb_id: &str) -> Result<String> {
        if is_resource_id(lb_id) {
            return Ok(lb_id.to_string());
        }
        Ok(network_resource_id(
            self.subscription_id()?,
            &self.config.resource_group,
            KIND_APPLICATION_GATEWAYS,
            lb_id,
        ))
    }

    /// ARM id of the virtual network backend addresses are joined to
    pub fn virtual_network_id(&self) -> Result<String> {
        if self.config.vnet_name.is_empty() {
            return Err(CloudError::Config("AZURE_VNET_NAME is not set".to_string()));
        }
        Ok(network_resource_id(
            self.subscription_id()?,
            &self.config.resource_group,
            KIND_VIRTUAL_NETWORKS,
            &self.config.vnet_name,
        ))
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.operation_timeout_secs)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?api-version={}", ARM_ENDPOINT, path, NETWORK_API_VERSION)
    }

    /// Valid bearer token for the next request, refreshed when the cached
    /// one is within [`TOKEN_REFRESH_BUFFER`] of expiry
    async fn bearer_token(&self) -> Result<String> {
        let credential = self.credential()?.clone();
        if let Some(token) = self.tokens.get(&credential.client_id) {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_BUFFER {
                return Ok(token.access_token.clone());
            }
        }
        self.authenticate(&credential).await
    }

    async fn authenticate(&self, credential: &AzureCredential) -> Result<String> {
        let url = format!("{}/{}/oauth2/v2.0/token", AAD_ENDPOINT, credential.tenant_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
            ("scope", ARM_SCOPE),
        ];
        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|err| CloudError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Config(format!(
                "token request for client '{}' failed with status {}",
                credential.client_id, status
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| CloudError::Other(anyhow::anyhow!("decoding token response: {err}")))?;
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in.max(0) as u64);
        self.tokens.insert(
            credential.client_id.clone(),
            TokenInfo { access_token: token.access_token.clone(), expires_at },
        );
        debug!(client_id = %credential.client_id, "refreshed ARM token");
        Ok(token.access_token)
    }

    /// Attach auth and send; transport failures become [`CloudError::Network`]
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.bearer_token().await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| CloudError::Network(err.to_string()))
    }

    pub async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        self.get_resource(id, "GetLoadBalancer").await
    }

    pub async fn put_load_balancer(&self, id: &str, lb: &LoadBalancer) -> Result<()> {
        self.put_with_retry(id, lb, "PutLoadBalancer").await
    }

    pub async fn get_application_gateway(&self, id: &str) -> Result<ApplicationGateway> {
        self.get_resource(id, "GetApplicationGateway").await
    }

    pub async fn put_application_gateway(&self, id: &str, gateway: &ApplicationGateway) -> Result<()> {
        self.put_with_retry(id, gateway, "PutApplicationGateway").await
    }

    async fn get_resource<T: serde::de::DeserializeOwned>(&self, id: &str, operation: &str) -> Result<T> {
        self.limiter.acquire().await;
        let timer = ApiTimer::start(self.metrics, CLOUD_LABEL, operation);
        let response = match self.send(self.http.get(self.url(id))).await {
            Ok(response) => response,
            Err(err) => {
                timer.failure(err.label());
                return Err(err);
            }
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify(status, &body, id, operation);
            timer.failure(err.label());
            return Err(err);
        }
        match response.json::<T>().await {
            Ok(resource) => {
                timer.success();
                Ok(resource)
            }
            Err(err) => {
                let err = CloudError::Other(anyhow::anyhow!("decoding {operation} response: {err}"));
                timer.failure(err.label());
                Err(err)
            }
        }
    }

    /// PUT with the begin retry loop: retryable begin failures back off
    /// [`WAIT_PERIOD_LB_DEALING`] and re-issue, everything else is final.
    /// Poll failures after an accepted begin are always final.
    async fn put_with_retry<T: serde::Serialize>(&self, id: &str, body: &T, operation: &str) -> Result<()> {
        let timeout = self.operation_timeout();
        let deadline = Instant::now() + timeout;
        let mut attempts: u32 = 0;
        loop {
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(timeout, operation.to_string()));
            }
            attempts += 1;
            match self.begin_put(id, body, operation).await {
                Ok(Some(poll_url)) => return self.wait(&poll_url, operation, deadline).await,
                Ok(None) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    if attempts >= MAX_RETRY {
                        return Err(CloudError::ExceededAttempts {
                            attempts,
                            message: err.to_string(),
                        });
                    }
                    debug!(attempt = attempts, resource = resource_name(id), error = %err, "resource busy, waiting");
                    tokio::time::sleep(WAIT_PERIOD_LB_DEALING).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Issue one PUT. `Ok(Some(url))` means the operation is running and
    /// `url` reports its progress, `Ok(None)` means it completed inline.
    async fn begin_put<T: serde::Serialize>(
        &self,
        id: &str,
        body: &T,
        operation: &str,
    ) -> Result<Option<String>> {
        self.limiter.acquire().await;
        let timer = ApiTimer::start(self.metrics, CLOUD_LABEL, operation);
        let response = match self.send(self.http.put(self.url(id)).json(body)).await {
            Ok(response) => response,
            Err(err) => {
                timer.failure(err.label());
                return Err(err);
            }
        };
        let status = response.status();
        if status.is_success() {
            let poll_url = header_url(&response, "Azure-AsyncOperation")
                .or_else(|| header_url(&response, "Location"));
            timer.success();
            return Ok(poll_url);
        }
        let body = response.text().await.unwrap_or_default();
        let err = classify(status, &body, id, operation);
        timer.failure(err.label());
        Err(err)
    }

    /// Poll until the operation reaches a terminal state or `deadline` passes
    async fn wait(&self, poll_url: &str, operation: &str, deadline: Instant) -> Result<()> {
        loop {
            let op = self.poll(poll_url, operation).await?;
            // A Location-style poll answers 200 with the resource itself once
            // the operation is done; that parses to an empty status.
            if op.status.is_empty() || op.status == OPERATION_STATUS_SUCCEEDED {
                return Ok(());
            }
            if op.is_terminal() {
                let message = match op.error {
                    Some(detail) => format!("{}: {}", detail.code, detail.message),
                    None => op.status,
                };
                return Err(CloudError::Operation { name: operation.to_string(), message });
            }
            if Instant::now() + POLL_INTERVAL >= deadline {
                return Err(CloudError::Timeout(self.operation_timeout(), operation.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn poll(&self, poll_url: &str, operation: &str) -> Result<ArmOperation> {
        self.limiter.acquire().await;
        let timer = ApiTimer::start(self.metrics, CLOUD_LABEL, operation);
        let response = match self.send(self.http.get(poll_url)).await {
            Ok(response) => response,
            Err(err) => {
                timer.failure(err.label());
                return Err(err);
            }
        };
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            timer.success();
            return Ok(ArmOperation { status: "InProgress".to_string(), error: None });
        }
        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            timer.success();
            return Ok(serde_json::from_str(&body).unwrap_or_default());
        }
        let body = response.text().await.unwrap_or_default();
        let err = classify(status, &body, poll_url, operation);
        timer.failure(err.label());
        Err(err)
    }

    /// Application gateway backend health, a POST answered via Location
    /// polling with the health document as the final body
    pub async fn application_gateway_backend_health(
        &self,
        id: &str,
    ) -> Result<ApplicationGatewayBackendHealth> {
        let operation = "GetBackendHealth";
        let deadline = Instant::now() + self.operation_timeout();

        self.limiter.acquire().await;
        let timer = ApiTimer::start(self.metrics, CLOUD_LABEL, operation);
        let url = self.url(&format!("{}/backendhealth", id));
        let response = match self.send(self.http.post(url)).await {
            Ok(response) => response,
            Err(err) => {
                timer.failure(err.label());
                return Err(err);
            }
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify(status, &body, id, operation);
            timer.failure(err.label());
            return Err(err);
        }
        let poll_url = header_url(&response, "Location")
            .or_else(|| header_url(&response, "Azure-AsyncOperation"));
        let Some(poll_url) = poll_url else {
            // Health came back inline
            return match response.json().await {
                Ok(health) => {
                    timer.success();
                    Ok(health)
                }
                Err(err) => {
                    let err =
                        CloudError::Other(anyhow::anyhow!("decoding backend health: {err}"));
                    timer.failure(err.label());
                    Err(err)
                }
            };
        };
        timer.success();

        loop {
            if Instant::now() + POLL_INTERVAL >= deadline {
                return Err(CloudError::Timeout(self.operation_timeout(), operation.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            self.limiter.acquire().await;
            let timer = ApiTimer::start(self.metrics, CLOUD_LABEL, operation);
            let response = match self.send(self.http.get(&poll_url)).await {
                Ok(response) => response,
                Err(err) => {
                    timer.failure(err.label());
                    return Err(err);
                }
            };
            let status = response.status();
            if status == StatusCode::ACCEPTED {
                timer.success();
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let err = classify(status, &body, id, operation);
                timer.failure(err.label());
                return Err(err);
            }
            return match response.json().await {
                Ok(health) => {
                    timer.success();
                    Ok(health)
                }
                Err(err) => {
                    let err =
                        CloudError::Other(anyhow::anyhow!("decoding backend health: {err}"));
                    timer.failure(err.label());
                    Err(err)
                }
            };
        }
    }
}

fn header_url(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

fn resource_kind(id: &str) -> &'static str {
    if is_application_gateway_id(id) { "applicationGateway" } else { "loadBalancer" }
}

/// Map an ARM failure response onto the error taxonomy. Throttling and the
/// in-progress conflict codes are retryable, 404 is not-found, the rest is
/// a final operation failure.
fn classify(status: StatusCode, body: &str, id: &str, operation: &str) -> CloudError {
    let detail = serde_json::from_str::<ArmErrorResponse>(body).unwrap_or_default().error;
    let message = if detail.code.is_empty() {
        format!("http status {}", status)
    } else {
        format!("{}: {}", detail.code, detail.message)
    };
    if status == StatusCode::TOO_MANY_REQUESTS || RETRYABLE_ARM_CODES.contains(&detail.code.as_str())
    {
        return CloudError::Retryable(message);
    }
    if status == StatusCode::NOT_FOUND {
        return CloudError::not_found(resource_kind(id), resource_name(id));
    }
    CloudError::Operation { name: operation.to_string(), message }
}
