//! Gantry Common - shared types and utilities
//!
//! This crate provides the foundational pieces used by every cloud crate:
//! - Classified error types
//! - Prometheus metrics for cloud API calls
//! - Token bucket rate limiting
//! - Environment configuration helpers
//! - Deterministic resource naming

pub mod env;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod ratelimit;

// Re-exports for convenience
pub use error::{CloudError, Result};
pub use ratelimit::RateLimiter;
