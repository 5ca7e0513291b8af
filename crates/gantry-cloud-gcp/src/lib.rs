//! Gantry GCP - network and HTTP(S) load balancer reconciler
//!
//! This crate provides:
//! - The GCP implementation of the `LoadBalance` trait
//! - A rate limited, metered compute client with operation polling
//! - Layer-4 listeners as Kubernetes Services with hand-built endpoints
//! - Layer-7 listeners as a global forwarding rule chain over zonal NEGs
//! - GCP-specific ingress validation

pub mod client;
pub mod config;
pub mod gclb;
pub mod l4;
pub mod l7;
pub mod link;
pub mod model;
pub mod neg;
pub mod token;
pub mod topology;
pub mod validator;

// Re-export the provider entry points
pub use config::GcpConfig;
pub use gclb::GcpGclb;
