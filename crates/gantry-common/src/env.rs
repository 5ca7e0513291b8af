//! Environment-backed configuration helpers
//!
//! Cloud credentials and tunables arrive through environment variables.
//! Unparsable values fall back to the default with a warning instead of
//! failing startup.

use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Default cloud API queries per second when no override is set
pub const DEFAULT_RATELIMIT_QPS: u64 = 50;

/// Default token bucket size when no override is set
pub const DEFAULT_RATELIMIT_BUCKET_SIZE: u64 = 50;

/// Read `key` and parse it, falling back to `default` when the variable is
/// unset or unparsable
pub fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid value '{}' for {}, falling back to {}", raw, key, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Read `key` as a string, falling back to `default` when unset or empty
pub fn env_string_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}
