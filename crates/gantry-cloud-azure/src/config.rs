//! Azure reconciler configuration
//!
//! Credentials come from the `AZURE_*` environment variables. The id,
//! secret, tenant and subscription variables accept comma-separated lists;
//! entries are zipped by index into one credential each and the client
//! round-robins over them per token acquisition.

use gantry_common::env::{
    DEFAULT_RATELIMIT_BUCKET_SIZE, DEFAULT_RATELIMIT_QPS, env_parse_or, env_string_or,
};
use gantry_common::{CloudError, Result};

// Environment variable names
pub const ENV_AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const ENV_AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const ENV_AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const ENV_AZURE_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
pub const ENV_AZURE_RESOURCE_GROUP: &str = "AZURE_RESOURCE_GROUP";
pub const ENV_AZURE_VNET_NAME: &str = "AZURE_VNET_NAME";
pub const ENV_AZURE_RATELIMIT_QPS: &str = "AZURE_RATELIMIT_QPS";
pub const ENV_AZURE_RATELIMIT_BUCKET_SIZE: &str = "AZURE_RATELIMIT_BUCKET_SIZE";

/// Upper bound on one begin-and-poll ARM operation
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 600;

/// One service principal the client can act as
#[derive(Clone, Debug, Default)]
pub struct AzureCredential {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub subscription_id: String,
}

impl AzureCredential {
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty()
            && !self.client_secret.is_empty()
            && !self.tenant_id.is_empty()
            && !self.subscription_id.is_empty()
    }
}

/// Configuration for the Azure reconciler
#[derive(Clone, Debug)]
pub struct AzureConfig {
    pub credentials: Vec<AzureCredential>,
    pub resource_group: String,
    pub vnet_name: String,
    /// Client-side queries per second toward the ARM API
    pub ratelimit_qps: u64,
    /// Token bucket burst size
    pub ratelimit_bucket_size: u64,
    pub operation_timeout_secs: u64,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            resource_group: String::new(),
            vnet_name: String::new(),
            ratelimit_qps: DEFAULT_RATELIMIT_QPS,
            ratelimit_bucket_size: DEFAULT_RATELIMIT_BUCKET_SIZE,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
        }
    }
}

impl AzureConfig {
    /// Load the configuration from environment variables
    pub fn from_env() -> Self {
        let client_ids = split_csv(&env_string_or(ENV_AZURE_CLIENT_ID, ""));
        let client_secrets = split_csv(&env_string_or(ENV_AZURE_CLIENT_SECRET, ""));
        let tenant_ids = split_csv(&env_string_or(ENV_AZURE_TENANT_ID, ""));
        let subscription_ids = split_csv(&env_string_or(ENV_AZURE_SUBSCRIPTION_ID, ""));

        let count = client_ids
            .len()
            .max(client_secrets.len())
            .max(tenant_ids.len())
            .max(subscription_ids.len());
        let credentials = (0..count)
            .map(|i| AzureCredential {
                client_id: pick(&client_ids, i),
                client_secret: pick(&client_secrets, i),
                tenant_id: pick(&tenant_ids, i),
                subscription_id: pick(&subscription_ids, i),
            })
            .collect();

        Self {
            credentials,
            resource_group: env_string_or(ENV_AZURE_RESOURCE_GROUP, ""),
            vnet_name: env_string_or(ENV_AZURE_VNET_NAME, ""),
            ratelimit_qps: env_parse_or(ENV_AZURE_RATELIMIT_QPS, DEFAULT_RATELIMIT_QPS),
            ratelimit_bucket_size: env_parse_or(
                ENV_AZURE_RATELIMIT_BUCKET_SIZE,
                DEFAULT_RATELIMIT_BUCKET_SIZE,
            ),
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
        }
    }

    /// Add one credential
    pub fn with_credential(mut self, credential: AzureCredential) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Set the resource group and virtual network the listeners live in
    pub fn with_scope(mut self, resource_group: &str, vnet_name: &str) -> Self {
        self.resource_group = resource_group.to_string();
        self.vnet_name = vnet_name.to_string();
        self
    }

    /// Set the client-side rate limit
    pub fn with_ratelimit(mut self, qps: u64, bucket_size: u64) -> Self {
        self.ratelimit_qps = qps;
        self.ratelimit_bucket_size = bucket_size;
        self
    }

    /// Check the configuration is usable before any ARM call
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(CloudError::Config("no Azure credentials configured".to_string()));
        }
        if let Some(broken) = self.credentials.iter().find(|c| !c.is_complete()) {
            return Err(CloudError::Config(format!(
                "Azure credential '{}' is missing a secret, tenant or subscription",
                broken.client_id
            )));
        }
        if self.resource_group.is_empty() {
            return Err(CloudError::Config("AZURE_RESOURCE_GROUP is not set".to_string()));
        }
        Ok(())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

/// Index into a zipped credential list; shorter lists repeat their entries
fn pick(values: &[String], index: usize) -> String {
    if values.is_empty() {
        return String::new();
    }
    values[index % values.len()].clone()
}
