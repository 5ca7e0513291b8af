//! AWS reconciler configuration

use gantry_common::env::{
    DEFAULT_RATELIMIT_BUCKET_SIZE, DEFAULT_RATELIMIT_QPS, env_parse_or, env_string_or,
};

// Environment variable names
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_RATELIMIT_QPS: &str = "AWS_RATELIMIT_QPS";
pub const ENV_AWS_RATELIMIT_BUCKET_SIZE: &str = "AWS_RATELIMIT_BUCKET_SIZE";

/// Configuration for the AWS reconciler
#[derive(Clone, Debug)]
pub struct AwsConfig {
    /// Static access key id; empty means the SDK default credential chain
    pub access_key_id: String,
    /// Static secret access key
    pub secret_access_key: String,
    /// Client-side queries per second toward the AWS APIs
    pub ratelimit_qps: u64,
    /// Token bucket burst size
    pub ratelimit_bucket_size: u64,
    /// Attempts the SDK may spend per call, including the first one
    pub max_attempts: u32,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            ratelimit_qps: DEFAULT_RATELIMIT_QPS,
            ratelimit_bucket_size: DEFAULT_RATELIMIT_BUCKET_SIZE,
            max_attempts: 5,
        }
    }
}

impl AwsConfig {
    /// Load the configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            access_key_id: env_string_or(ENV_AWS_ACCESS_KEY_ID, ""),
            secret_access_key: env_string_or(ENV_AWS_SECRET_ACCESS_KEY, ""),
            ratelimit_qps: env_parse_or(ENV_AWS_RATELIMIT_QPS, DEFAULT_RATELIMIT_QPS),
            ratelimit_bucket_size: env_parse_or(
                ENV_AWS_RATELIMIT_BUCKET_SIZE,
                DEFAULT_RATELIMIT_BUCKET_SIZE,
            ),
            ..Default::default()
        }
    }

    /// Set static credentials
    pub fn with_credentials(mut self, access_key_id: &str, secret_access_key: &str) -> Self {
        self.access_key_id = access_key_id.to_string();
        self.secret_access_key = secret_access_key.to_string();
        self
    }

    /// Set the client-side rate limit
    pub fn with_ratelimit(mut self, qps: u64, bucket_size: u64) -> Self {
        self.ratelimit_qps = qps;
        self.ratelimit_bucket_size = bucket_size;
        self
    }

    pub fn has_static_credentials(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}
