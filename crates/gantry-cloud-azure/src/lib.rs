//! Gantry Azure - LoadBalancer and ApplicationGateway reconciler
//!
//! This crate provides:
//! - The Azure implementation of the `LoadBalance` trait
//! - A rate limited, metered ARM client with begin-and-poll mutations
//! - Whole-resource convergence of listener-owned sub-resources
//! - Azure-specific ingress validation

pub mod alb;
pub mod appgateway;
pub mod armmodel;
pub mod client;
pub mod config;
pub mod loadbalancer;
pub mod resource_id;
pub mod validator;

// Re-export the provider entry points
pub use alb::AzureAlb;
pub use config::AzureConfig;
