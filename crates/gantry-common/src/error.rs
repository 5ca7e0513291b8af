//! Error types shared by the cloud reconcilers
//!
//! This module defines:
//! - `CloudError`: classified cloud API and reconcile errors
//! - `Result`: crate-wide result alias
//!
//! SDK wrappers classify raw provider errors into `CloudError` once, at the
//! lowest layer; reconcilers only add context and propagate. Nothing above
//! the wrapper retries on its own: re-running an ensure IS the retry.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, CloudError>;

/// Classified cloud reconcile errors
#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("load balancer '{0}' not found")]
    LoadBalancerNotFound(String),

    #[error("{kind} '{name}' not found")]
    ResourceNotFound { kind: String, name: String },

    /// Transient provider condition, safe to retry with the same arguments
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("still failing after {attempts} attempts: {message}")]
    ExceededAttempts { attempts: u32, message: String },

    /// Asynchronous provider operation finished in an error state
    #[error("operation '{name}' failed: {message}")]
    Operation { name: String, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CloudError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        CloudError::ResourceNotFound { kind: kind.to_string(), name: name.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CloudError::LoadBalancerNotFound(_) | CloudError::ResourceNotFound { .. }
        )
    }

    /// Whether calling the failed operation again with the same arguments
    /// can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Retryable(_) | CloudError::Network(_))
    }

    /// Stable label for metrics, one value per variant
    pub fn label(&self) -> &'static str {
        match self {
            CloudError::LoadBalancerNotFound(_) => "lb_not_found",
            CloudError::ResourceNotFound { .. } => "not_found",
            CloudError::Retryable(_) => "retryable",
            CloudError::ExceededAttempts { .. } => "exceeded_attempts",
            CloudError::Operation { .. } => "operation_failed",
            CloudError::Validation(_) => "validation",
            CloudError::Timeout(..) => "timeout",
            CloudError::Network(_) => "network",
            CloudError::Config(_) => "config",
            CloudError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(CloudError::LoadBalancerNotFound("lb-1".to_string()).is_not_found());
        assert!(CloudError::not_found("targetGroup", "tg-1").is_not_found());
        assert!(!CloudError::Retryable("conflict".to_string()).is_not_found());
    }

    #[test]
    fn test_retryable_predicate() {
        assert!(CloudError::Retryable("operation in progress".to_string()).is_retryable());
        assert!(CloudError::Network("connection reset".to_string()).is_retryable());
        assert!(!CloudError::Validation("bad port".to_string()).is_retryable());
        assert!(
            !CloudError::ExceededAttempts { attempts: 25, message: "busy".to_string() }
                .is_retryable()
        );
    }

    #[test]
    fn test_error_display() {
        let err = CloudError::LoadBalancerNotFound("lb-1234".to_string());
        assert_eq!(err.to_string(), "load balancer 'lb-1234' not found");

        let err = CloudError::Operation {
            name: "op-99".to_string(),
            message: "quota exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'op-99' failed: quota exceeded");
    }

    #[test]
    fn test_error_labels_are_stable() {
        assert_eq!(CloudError::Retryable(String::new()).label(), "retryable");
        assert_eq!(CloudError::Timeout(Duration::from_secs(30), String::new()).label(), "timeout");
        assert_eq!(CloudError::Other(anyhow::anyhow!("boom")).label(), "other");
    }
}
