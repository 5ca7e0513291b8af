//! Gantry AWS - ELBv2 and Global Accelerator reconciler
//!
//! This crate provides:
//! - The AWS implementation of the `LoadBalance` trait
//! - Rate limited, metered wrappers around the AWS SDK clients
//! - Custom routing port-run compression for Global Accelerator
//! - AWS-specific ingress validation

pub mod aga;
pub mod config;
pub mod elb;
pub mod sdk;
pub mod validator;

// Re-export the provider entry points
pub use config::AwsConfig;
pub use elb::AwsElb;
