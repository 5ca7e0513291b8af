//! Gantry API - shared listener and ingress models
//!
//! This crate provides:
//! - Cloud-neutral listener/target-group data models
//! - Ingress models consumed by the per-cloud validators
//! - Input validation utilities

pub mod ingress;
pub mod model;
pub mod validation;

// Re-export commonly used types
pub use ingress::*;
pub use model::*;
pub use validation::*;
